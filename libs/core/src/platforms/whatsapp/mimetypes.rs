//! Media types the provider accepts for outbound attachments.

/// Provider message type used to send an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Document,
    Sticker,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Document => "document",
            MediaKind::Sticker => "sticker",
        }
    }

    /// Classifies an attachment mimetype; `None` means the provider rejects it.
    ///
    /// ```
    /// use gwb_core::platforms::whatsapp::mimetypes::MediaKind;
    ///
    /// assert_eq!(MediaKind::for_mimetype("application/pdf"), Some(MediaKind::Document));
    /// assert_eq!(MediaKind::for_mimetype("audio/ogg; codecs=opus"), Some(MediaKind::Audio));
    /// assert_eq!(MediaKind::for_mimetype("application/zip"), None);
    /// ```
    pub fn for_mimetype(mimetype: &str) -> Option<MediaKind> {
        let kind = match base_mimetype(mimetype).as_str() {
            "text/plain"
            | "application/pdf"
            | "application/vnd.ms-powerpoint"
            | "application/msword"
            | "application/vnd.ms-excel"
            | "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            | "application/vnd.openxmlformats-officedocument.presentationml.presentation"
            | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => {
                MediaKind::Document
            }
            "audio/aac" | "audio/mp4" | "audio/mpeg" | "audio/amr" | "audio/ogg" => {
                MediaKind::Audio
            }
            "image/jpeg" | "image/png" => MediaKind::Image,
            "video/mp4" | "video/3gp" => MediaKind::Video,
            "image/webp" => MediaKind::Sticker,
            _ => return None,
        };
        Some(kind)
    }
}

/// Lowercased mimetype without parameters.
pub fn base_mimetype(mimetype: &str) -> String {
    mimetype
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// File extension (with dot) conventionally used for a mimetype.
pub fn extension_for(mimetype: &str) -> Option<&'static str> {
    let ext = match base_mimetype(mimetype).as_str() {
        "text/plain" => ".txt",
        "application/pdf" => ".pdf",
        "application/vnd.ms-powerpoint" => ".ppt",
        "application/msword" => ".doc",
        "application/vnd.ms-excel" => ".xls",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => ".docx",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation" => ".pptx",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => ".xlsx",
        "audio/aac" => ".aac",
        "audio/mp4" => ".m4a",
        "audio/mpeg" => ".mp3",
        "audio/amr" => ".amr",
        "audio/ogg" => ".ogg",
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/webp" => ".webp",
        "video/mp4" => ".mp4",
        "video/3gp" | "video/3gpp" => ".3gp",
        _ => return None,
    };
    Some(ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn office_formats_are_documents() {
        for mimetype in [
            "application/msword",
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            "TEXT/PLAIN",
        ] {
            assert_eq!(MediaKind::for_mimetype(mimetype), Some(MediaKind::Document));
        }
    }

    #[test]
    fn extensions_ignore_parameters() {
        assert_eq!(extension_for("audio/ogg; codecs=opus"), Some(".ogg"));
        assert_eq!(extension_for("image/jpeg"), Some(".jpg"));
        assert_eq!(extension_for("application/x-unknown"), None);
    }
}
