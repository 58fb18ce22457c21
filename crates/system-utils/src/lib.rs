pub mod lines;
pub mod path;
pub mod process;
