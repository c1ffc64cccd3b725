//! Agent execution core: one engine, many families.
//!
//! A family (math, date/time, calendar, receptionist, …) is described by an
//! [`AgentCapability`] record; the [`Agent`] engine renders the family's
//! prompt, parses the XML-ish model response, optionally generates and runs
//! code with iterative auto-debugging, and formats the final spoken answer.

mod agent;
mod capability;
mod debugger;
mod error;
mod response;

pub use agent::{Agent, AgentStateFile};
pub use capability::{AgentCapability, CapabilityRegistry, FormatterMode};
pub use debugger::{DebugOutcome, run_debug_loop};
pub use error::AgentError;
pub use response::{
    ParseStrategy, ParsedResponse, extract_code_lines, get_tag_value, parse_response,
    render_response_schema,
};
