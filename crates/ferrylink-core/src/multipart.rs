//! `multipart/form-data` request bodies.

use crate::request::Request;
use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

#[derive(Debug, Clone)]
enum Part {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        filename: String,
        content_type: String,
        data: Bytes,
    },
}

/// Builder for a multipart upload.
#[derive(Debug, Clone)]
pub struct MultipartForm {
    boundary: String,
    parts: Vec<Part>,
}

impl MultipartForm {
    pub fn new() -> Self {
        let nonce: u128 = rand::rng().random();
        Self {
            boundary: format!("ferrylink-{:032x}", nonce),
            parts: Vec::new(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn add_text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(Part::Text {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn add_file(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        self.parts.push(Part::File {
            name: name.into(),
            filename: filename.into(),
            content_type: content_type.into(),
            data: data.into(),
        });
        self
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Encoded body, closed with the terminating boundary.
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        for part in &self.parts {
            body.put_slice(format!("--{}\r\n", self.boundary).as_bytes());
            match part {
                Part::Text { name, value } => {
                    body.put_slice(
                        format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                            .as_bytes(),
                    );
                    body.put_slice(value.as_bytes());
                }
                Part::File {
                    name,
                    filename,
                    content_type,
                    data,
                } => {
                    body.put_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                             Content-Type: {}\r\n\r\n",
                            name, filename, content_type
                        )
                        .as_bytes(),
                    );
                    body.put_slice(data);
                }
            }
            body.put_slice(b"\r\n");
        }
        body.put_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        body.freeze()
    }

    /// Uncached `POST` to `path` carrying this form.
    pub fn into_request(self, path: impl Into<String>) -> Request {
        Request::post(path)
            .with_header("Content-Type", self.content_type())
            .with_body(self.encode())
            .with_cache(false)
    }
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::HttpMethod;

    #[test]
    fn test_encoded_layout() {
        let form = MultipartForm::new()
            .add_text("title", "cat")
            .add_file("photo", "cat.png", "image/png", &b"\x89PNG"[..]);
        let boundary = form.boundary().to_string();
        let body = form.encode();

        let expected_head = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\ncat\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"photo\"; filename=\"cat.png\"\r\n\
             Content-Type: image/png\r\n\r\n",
            b = boundary
        );
        assert!(body.starts_with(expected_head.as_bytes()));
        assert!(body.ends_with(format!("\r\n--{}--\r\n", boundary).as_bytes()));
    }

    #[test]
    fn test_into_request() {
        let form = MultipartForm::new().add_text("a", "1");
        let boundary = form.boundary().to_string();
        let request = form.into_request("/upload");

        assert_eq!(request.method(), HttpMethod::Post);
        assert_eq!(
            request.header("content-type"),
            Some(format!("multipart/form-data; boundary={}", boundary).as_str())
        );
        assert!(!request.is_cacheable());
    }

    #[test]
    fn test_boundaries_differ() {
        assert_ne!(MultipartForm::new().boundary(), MultipartForm::new().boundary());
    }
}
