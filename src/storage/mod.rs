mod subscribers;

pub use subscribers::{FeedSubscription, Registry, StoreError, SubscriberStore, Subscriptions};
