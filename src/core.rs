//! Types that represent the operator's instructions: the plan and its commands.

pub mod command;
pub mod plan;
pub mod setup;

#[doc(inline)]
pub use self::command::{CommandInfo, Distro, Extra, KeyRecipient, Location};

#[doc(inline)]
pub use self::plan::{Plan, PlanEntry, Status};

#[doc(inline)]
pub use self::setup::Setup;
