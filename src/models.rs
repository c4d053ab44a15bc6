//! These models represent the objects passed around by the agent
//!
//! There are several related formats we need to interact with:
//! - openai-style messages/tools, sent from the agent to the LLM
//! - toolkit requests, sent from the agent to the capability providers
//! - checkpoint state, persisted per conversation thread
//!
//! These overlap but do not coincide, so everything is converted into the
//! internal structs here at the boundary and back out with to/from helpers.
pub mod message;
pub mod role;
pub mod tool;
