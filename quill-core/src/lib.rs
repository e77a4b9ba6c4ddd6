mod client;

pub use client::{
    ActivityFields, ActivityTypeFields, ApiErrorClass, AttachmentFields, Change, CreatedResource,
    FilterFields, IdMapping, NoteFields, PullResponse, PushRequest, PushResponse, QuillClient,
    QuillError, Resource, Row, SpaceFields, TagFields, format_timestamp_ms, parse_timestamp_ms,
};
