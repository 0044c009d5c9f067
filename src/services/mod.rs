pub mod dispatcher;
pub mod fcm;
pub mod feed;
pub mod init;
pub mod push;
