pub mod config;
pub mod download;
pub mod exec;
pub mod files;
pub mod git;
pub mod integrity;
pub mod logging;
pub mod registry;
pub mod report;
pub mod runtime;
pub mod site;
pub mod sql;
pub mod streams;
