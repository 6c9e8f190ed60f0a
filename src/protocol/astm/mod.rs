pub mod constants;
pub mod frame;
pub mod link;
pub mod message;
pub mod record;

pub use frame::{split_into_frames, split_into_frames_with_limit, Frame};
pub use link::{AstmLink, LinkState, LinkTimeouts, SendOutcome};
pub use message::{quick_classify, AstmMessage, MessageType, ResultEntry};
pub use record::{
    format_datetime, parse_datetime, HeaderRecord, MResultRecord, OrderRecord, PatientRecord,
    QueryRecord, Record, RecordType, ResultRecord, TerminatorRecord,
};
