pub mod billing;
pub mod calendar_sync;
pub mod crm;
pub mod event;
pub mod user;

pub use billing::{BillingRecord, Plan, SubscriptionStatus, UsageRecord, UserSubscription};
pub use calendar_sync::{CalendarSync, SyncProvider};
pub use crm::{Activity, Company, Contact, CrmTask, Deal, DealStage, DealStageChange, Lead};
pub use event::{Attendee, Event, EventSource, NewAttendee};
pub use user::{AuthProviderLink, User};
