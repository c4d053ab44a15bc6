pub mod agent;
pub mod approval;
pub mod assistant;
pub mod crm;
pub mod errors;
pub mod filter;
pub mod models;
pub mod prompt_template;
pub mod providers;
pub mod session;
pub mod toolkit;
