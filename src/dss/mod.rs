//! Delayed submission: queue answers in memory, release them to storage in
//! randomized batches so submission time and persistence time never line up.

pub mod policy;
pub mod queue;
pub mod response;
pub mod scheduler;

pub use policy::{Dice, FixedDice, FlushPolicy, ThreadRngDice};
pub use queue::{PendingQueue, SurveyQueueState};
pub use response::{PendingResponse, QuestionType, SubmittedAnswer, SurveyId};
pub use scheduler::{DssStatus, FlushResult, FlushScheduler, SurveyStatus, TickReport};
