pub mod config;
pub mod fsm;
pub mod mcp;
pub mod model;
pub mod schema;
pub mod shared;
