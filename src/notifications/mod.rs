pub mod mailer;
pub mod notices;
pub mod senders;

pub use mailer::MailService;
pub use notices::{Notice, NoticeBroadcaster};
