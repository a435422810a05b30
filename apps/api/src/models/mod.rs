pub mod results;
pub mod workflow;
