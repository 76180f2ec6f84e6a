// Gisma Link: Reply decoding
//
// The only place that knows how the server marks the end of a reply stream
// and what a new-chat metadata frame looks like.

use crate::atoms::constants::DONE_SENTINEL;
use crate::atoms::error::{LinkError, LinkResult};
use crate::atoms::types::{ChatMetadata, ReplyFrame};

/// Classify one reply-channel body. Empty, whitespace-only and the literal
/// `[DONE]` marker complete the stream; anything else is a text fragment.
pub fn decode_reply(body: &str) -> ReplyFrame {
    if body.trim().is_empty() || body == DONE_SENTINEL {
        ReplyFrame::Complete
    } else {
        ReplyFrame::Chunk(body.to_string())
    }
}

/// Strict decode of `{ "chatId": string, "description": string }`.
pub fn decode_metadata(body: &str) -> LinkResult<ChatMetadata> {
    let meta: ChatMetadata = serde_json::from_str(body)
        .map_err(|e| LinkError::protocol(format!("Malformed chat metadata: {}", e)))?;
    if meta.chat_id.trim().is_empty() {
        return Err(LinkError::protocol("Chat metadata carries an empty chatId"));
    }
    Ok(meta)
}

/// Per-chat reply destination, e.g. `/user/queue/chat.abc`.
pub fn reply_destination(chat_id: &str) -> String {
    format!("{}{}", crate::atoms::constants::REPLY_DESTINATION_PREFIX, chat_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_complete_the_stream() {
        assert_eq!(decode_reply(""), ReplyFrame::Complete);
        assert_eq!(decode_reply("   \n\t"), ReplyFrame::Complete);
        assert_eq!(decode_reply("[DONE]"), ReplyFrame::Complete);
    }

    #[test]
    fn everything_else_is_a_chunk() {
        assert_eq!(decode_reply("Hel"), ReplyFrame::Chunk("Hel".into()));
        // leading whitespace is part of the token stream
        assert_eq!(decode_reply(" world"), ReplyFrame::Chunk(" world".into()));
        assert_eq!(decode_reply("[DONE] but more"), ReplyFrame::Chunk("[DONE] but more".into()));
    }

    #[test]
    fn metadata_decodes_typed_payload() {
        let meta = decode_metadata(r#"{"chatId":"abc","description":"Greeting"}"#).unwrap();
        assert_eq!(meta.chat_id, "abc");
        assert_eq!(meta.description, "Greeting");
    }

    #[test]
    fn metadata_shape_mismatch_is_protocol_error() {
        assert!(matches!(decode_metadata("not json"), Err(LinkError::Protocol(_))));
        assert!(matches!(decode_metadata(r#"{"chatId":42,"description":"x"}"#), Err(LinkError::Protocol(_))));
        assert!(matches!(decode_metadata(r#"{"description":"x"}"#), Err(LinkError::Protocol(_))));
        assert!(matches!(decode_metadata(r#"{"chatId":" ","description":"x"}"#), Err(LinkError::Protocol(_))));
    }

    #[test]
    fn reply_destination_appends_chat_id() {
        assert_eq!(reply_destination("abc"), "/user/queue/chat.abc");
    }
}
