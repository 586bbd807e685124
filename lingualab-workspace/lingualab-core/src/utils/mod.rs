pub mod fsio;
pub mod path;
