//! Document identifiers.

/// Length of a generated identifier in hex characters.
pub const ID_LEN: usize = 24;

/// Generate a new 24-character lowercase hex identifier.
///
/// Samples and label elements share this id space, so a label element's id
/// can be reused verbatim as the id of the patch extracted from it.
pub fn generate_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(ID_LEN);
    id
}

/// Whether `s` looks like an id produced by [`generate_id`].
pub fn is_valid_id(s: &str) -> bool {
    s.len() == ID_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}
