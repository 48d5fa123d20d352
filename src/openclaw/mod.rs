pub mod cli;
pub mod logs;
pub mod reconciler;
