use serde::{Deserialize, Serialize};

use crate::error::IdError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    File,
}

impl MediaKind {
    /// Home-protocol message type for this media kind.
    pub fn msgtype(self) -> &'static str {
        match self {
            MediaKind::Image => "m.image",
            MediaKind::Video => "m.video",
            MediaKind::Audio => "m.audio",
            MediaKind::File => "m.file",
        }
    }

    pub fn from_msgtype(msgtype: &str) -> Option<Self> {
        match msgtype {
            "m.image" => Some(MediaKind::Image),
            "m.video" => Some(MediaKind::Video),
            "m.audio" => Some(MediaKind::Audio),
            "m.file" => Some(MediaKind::File),
            _ => None,
        }
    }
}

/// Kind of an inbound remote message, decoded once from its type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteMessageKind {
    Text,
    Media(MediaKind),
    Contact,
    Location,
    /// Deletion of an earlier message. Arrives as an empty text message, so
    /// it is never produced by [`RemoteMessageKind::parse`] alone.
    Revoke,
}

impl RemoteMessageKind {
    pub fn parse(tag: &str) -> Result<Self, IdError> {
        let kind = match tag {
            "RichText" | "Text" => RemoteMessageKind::Text,
            "RichText/UriObject" => RemoteMessageKind::Media(MediaKind::Image),
            "RichText/Media_Video" => RemoteMessageKind::Media(MediaKind::Video),
            "RichText/Media_AudioMsg" => RemoteMessageKind::Media(MediaKind::Audio),
            "RichText/Media_GenericFile" => RemoteMessageKind::Media(MediaKind::File),
            "RichText/Contacts" => RemoteMessageKind::Contact,
            "RichText/Location" => RemoteMessageKind::Location,
            other => return Err(IdError::UnknownMessageType(other.to_string())),
        };
        Ok(kind)
    }

    pub fn tag(self) -> &'static str {
        match self {
            RemoteMessageKind::Text | RemoteMessageKind::Revoke => "RichText",
            RemoteMessageKind::Media(MediaKind::Image) => "RichText/UriObject",
            RemoteMessageKind::Media(MediaKind::Video) => "RichText/Media_Video",
            RemoteMessageKind::Media(MediaKind::Audio) => "RichText/Media_AudioMsg",
            RemoteMessageKind::Media(MediaKind::File) => "RichText/Media_GenericFile",
            RemoteMessageKind::Contact => "RichText/Contacts",
            RemoteMessageKind::Location => "RichText/Location",
        }
    }
}
