pub mod message;

pub use message::{
    HITL_ERROR_TOPIC, HITL_REQUEST_TOPIC, HITL_RESPONSE_TOPIC, HitlRequest, HitlResponse,
    ReviewAction, ReviewOutcome, UNSPECIFIED_NODE, WsEvent,
};
