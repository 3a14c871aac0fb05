//! Hand-built `multipart/form-data` bodies for audio uploads.

pub const BOUNDARY: &str = "----OffGridRustBoundary";
const FALLBACK_AUDIO_TYPE: &str = "audio/wav";

enum Part {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        filename: String,
        content_type: String,
        bytes: Vec<u8>,
    },
}

/// Parts are written in insertion order, separated by CRLF, with a fixed boundary.
#[derive(Default)]
pub struct MultipartForm {
    parts: Vec<Part>,
}

impl MultipartForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(Part::Text {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// File part; its content type is guessed from `filename`.
    pub fn file(mut self, name: impl Into<String>, filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        let filename = filename.into();
        self.parts.push(Part::File {
            name: name.into(),
            content_type: guess_content_type(&filename),
            filename,
            bytes,
        });
        self
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={BOUNDARY}")
    }

    pub fn into_body(self) -> Vec<u8> {
        let delimiter = format!("--{BOUNDARY}");
        let mut lines: Vec<Vec<u8>> = Vec::new();
        for part in self.parts {
            lines.push(delimiter.clone().into_bytes());
            match part {
                Part::Text { name, value } => {
                    lines.push(format!("Content-Disposition: form-data; name=\"{name}\"").into_bytes());
                    lines.push(Vec::new());
                    lines.push(value.into_bytes());
                }
                Part::File {
                    name,
                    filename,
                    content_type,
                    bytes,
                } => {
                    lines.push(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\""
                        )
                        .into_bytes(),
                    );
                    lines.push(format!("Content-Type: {content_type}").into_bytes());
                    lines.push(Vec::new());
                    lines.push(bytes);
                }
            }
        }
        lines.push(format!("{delimiter}--").into_bytes());
        lines.join(&b"\r\n"[..])
    }
}

/// Content type for an upload, from its extension.
pub fn guess_content_type(filename: &str) -> String {
    let extension = std::path::Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());
    let mime = match extension.as_deref() {
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("mp4") => "video/mp4",
        Some("ogg" | "oga") => "audio/ogg",
        Some("opus") => "audio/opus",
        Some("flac") => "audio/flac",
        Some("webm") => "audio/webm",
        Some("aac") => "audio/aac",
        _ => FALLBACK_AUDIO_TYPE,
    };
    mime.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_layout_matches_form_encoding() {
        let form = MultipartForm::new()
            .file("file", "clip.mp3", b"ID3\x00".to_vec())
            .text("language", "es")
            .text("response_format", "json");
        assert_eq!(
            form.content_type(),
            "multipart/form-data; boundary=----OffGridRustBoundary"
        );
        let body = form.into_body();
        let mut expected = Vec::new();
        expected.extend_from_slice(
            b"------OffGridRustBoundary\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"clip.mp3\"\r\n\
Content-Type: audio/mpeg\r\n\
\r\n\
ID3\x00\r\n\
------OffGridRustBoundary\r\n\
Content-Disposition: form-data; name=\"language\"\r\n\
\r\n\
es\r\n\
------OffGridRustBoundary\r\n\
Content-Disposition: form-data; name=\"response_format\"\r\n\
\r\n\
json\r\n\
------OffGridRustBoundary--",
        );
        assert_eq!(body, expected);
    }

    #[test]
    fn unknown_extension_falls_back_to_wav() {
        assert_eq!(guess_content_type("recording.zzaudio"), "audio/wav");
        assert_eq!(guess_content_type("voice.MP3"), "audio/mpeg");
        assert_eq!(guess_content_type("no_extension"), "audio/wav");
    }
}
