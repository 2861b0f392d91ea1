pub mod bridge;
pub mod broker;
pub mod events;
pub mod registry;

pub use bridge::{BridgeSettings, ChatRequest, SessionBridge, CANCELLED_MESSAGE};
pub use broker::{PendingQuestion, QuestionBroker, QuestionError, QuestionScope};
pub use events::{Answer, AnswerValue, Question, QuestionOption, StreamEvent};
pub use registry::{RegistryError, RequestHandle, RequestRegistry};
