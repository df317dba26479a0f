/// Errors raised while encoding or decoding typed values.
#[derive(Debug)]
pub enum CodecError {
    /// A known tag was present but the lexical part did not parse.
    MalformedTag { tag: &'static str, lexical: String },

    /// A tag-shaped suffix was present but is not in the tag table.
    UnknownTag(String),

    /// The surrounding document was not valid JSON.
    Json(String),

    /// The surrounding document was not valid msgpack.
    Binary(String),

    /// A value kind the codec cannot represent (e.g. a non-finite float).
    Unrepresentable(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::MalformedTag { tag, lexical } => {
                write!(f, "malformed '{tag}' value: {lexical:?}")
            }
            CodecError::UnknownTag(tag) => write!(f, "unknown type tag: {tag:?}"),
            CodecError::Json(msg) => write!(f, "invalid JSON payload: {msg}"),
            CodecError::Binary(msg) => write!(f, "invalid binary payload: {msg}"),
            CodecError::Unrepresentable(msg) => write!(f, "unrepresentable value: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}
