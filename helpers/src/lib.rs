pub mod placeholders;
pub mod retries;
pub mod venv;
