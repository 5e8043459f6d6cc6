pub mod generator;

pub use generator::HttpScriptGenerator;
