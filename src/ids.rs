//! Bare UUID v4 id generation, matching the teacher's convention of unprefixed
//! string ids rather than a `run_`/`sess_`-style prefixed scheme.

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
