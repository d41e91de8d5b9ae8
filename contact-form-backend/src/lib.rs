pub mod error_page;
pub mod mailer;
pub mod origin;
pub mod report;
pub mod server;
pub mod settings;
pub mod spam_log;
pub mod submission;
pub mod token;
