pub mod chart;
pub mod config;
pub mod errors;
pub mod history;
pub mod models;
pub mod normalize;
pub mod registry;
pub mod relay;
pub mod upstream;
pub mod web;
