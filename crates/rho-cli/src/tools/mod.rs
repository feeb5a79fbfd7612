//! Built-in tools for the agent

mod calculator;

pub use calculator::CalculatorTool;
