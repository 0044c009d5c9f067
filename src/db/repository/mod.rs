pub mod feed_event_repository;
pub mod push_notification_repository;
pub mod user;

pub use feed_event_repository::FeedEventRepository;
pub use push_notification_repository::PushNotificationRepository;
pub use user::UserRepository;
