use std::io::Read as _;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub const BOOK_ID: &str = "123";

pub static FIG1_PNG: &[u8] = &[
    137, 80, 78, 71, 13, 10, 26, 10, 0, 0, 0, 13, 73, 72, 68, 82, 0, 0, 0, 1, 0, 0, 0, 1, 8, 4, 0,
    0, 0, 181, 28, 12, 2, 0, 0, 0, 11, 73, 68, 65, 84, 120, 218, 99, 252, 255, 23, 0, 2, 3, 1, 128,
    110, 220, 25, 0, 0, 0, 0, 73, 69, 78, 68, 174, 66, 96, 130,
];

pub static COVER_JPG: &[u8] = b"\xff\xd8\xff\xe0stub-cover\xff\xd9";

const LOGIN_PAGE: &str = r#"<!doctype html>
<html>
  <head><title>Sign in</title></head>
  <body>
    <form method="post" action="/accounts/login/">
      <input type="hidden" name="csrfmiddlewaretoken" value="tok">
      <input type="email" name="email">
      <input type="password" name="password1">
      <input type="submit" value="Sign in">
    </form>
  </body>
</html>
"#;

const TOC_JSON: &str = r#"{
  "title": "My Book",
  "title_safe": "my-book",
  "book_id": 123,
  "thumbnail_tag": "<img src=\"/cov.jpg\" alt=\"My Book\">",
  "items": [
    {"url": "/api/v1/book/123/chapter/ch01.html", "full_path": "ch01.html", "label": "Getting Started"},
    {"url": "/api/v1/book/123/chapter/ch02.html", "full_path": "part2/ch02.html"}
  ]
}"#;

const CH01_DESCRIPTOR: &str = r#"{
  "content": "/api/v1/book/123/chapter-content/ch01.html",
  "full_path": "ch01.html",
  "images": ["graphics/fig1.png", null]
}"#;

const CH02_DESCRIPTOR: &str = r#"{
  "content": "/api/v1/book/123/chapter-content/ch02.html",
  "full_path": "part2/ch02.html",
  "images": []
}"#;

const CH01_HTML: &str = r#"<html><head><title>x</title></head><body>
<h1>Chapter 1</h1>
<p>First chapter&nbsp;text.</p>
<img src="graphics/fig1.png" alt="fig"><br>
</body></html>"#;

const CH02_HTML: &str = "<html><body><p>Second chapter</p></body></html>";

const SESSION_COOKIE: &str = "sessionid=stub-session";

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TocBehavior {
    Valid,
    Malformed,
}

#[derive(Debug, Clone)]
pub struct BookStubConfig {
    pub toc: TocBehavior,
    /// Paths answered with HTTP 500.
    pub failing_paths: Vec<&'static str>,
}

impl Default for BookStubConfig {
    fn default() -> Self {
        Self {
            toc: TocBehavior::Valid,
            failing_paths: Vec::new(),
        }
    }
}

/// Minimal stand-in for the book host: a login form, a session cookie, the
/// TOC endpoint, chapter descriptors, chapter bodies, a cover and one image.
pub struct BookStub {
    pub base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl BookStub {
    pub fn spawn(config: BookStubConfig) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start book stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}");

        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let mut request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let url = request.url().to_string();
                let method = request.method().clone();
                seen.lock().unwrap().push(format!("{method} {url}"));

                let has_session = request.headers().iter().any(|h| {
                    h.field.equiv("Cookie") && h.value.as_str().contains(SESSION_COOKIE)
                });

                if config.failing_paths.iter().any(|p| *p == url) {
                    let _ = request.respond(
                        tiny_http::Response::from_string("boom").with_status_code(500),
                    );
                    continue;
                }

                if method == tiny_http::Method::Post && url == "/accounts/login/" {
                    let mut body = String::new();
                    let _ = request.as_reader().read_to_string(&mut body);
                    let accepted = body.contains("csrfmiddlewaretoken=tok")
                        && body.contains("password1=secret");
                    let response = if accepted {
                        tiny_http::Response::empty(302)
                            .with_header(header("Location", "/home/"))
                            .with_header(header("Set-Cookie", &format!("{SESSION_COOKIE}; Path=/")))
                    } else {
                        tiny_http::Response::empty(302)
                            .with_header(header("Location", "/accounts/login/?failed=1"))
                    };
                    let _ = request.respond(response);
                    continue;
                }

                let (status, content_type, body): (u16, &str, Vec<u8>) = match url.as_str() {
                    "/" | "/accounts/login/?failed=1" => {
                        (200, "text/html", LOGIN_PAGE.as_bytes().to_vec())
                    }
                    "/home/" => (200, "text/html", b"<p>welcome</p>".to_vec()),
                    "/nest/epub/toc/?book_id=123" if !has_session => {
                        (403, "text/plain", b"no session".to_vec())
                    }
                    "/nest/epub/toc/?book_id=123" => match config.toc {
                        TocBehavior::Valid => {
                            (200, "application/json", TOC_JSON.as_bytes().to_vec())
                        }
                        TocBehavior::Malformed => (
                            200,
                            "text/html",
                            b"<html>session expired</html>".to_vec(),
                        ),
                    },
                    "/cov.jpg" => (200, "image/jpeg", COVER_JPG.to_vec()),
                    "/api/v1/book/123/chapter/ch01.html" => {
                        (200, "application/json", CH01_DESCRIPTOR.as_bytes().to_vec())
                    }
                    "/api/v1/book/123/chapter/ch02.html" => {
                        (200, "application/json", CH02_DESCRIPTOR.as_bytes().to_vec())
                    }
                    "/api/v1/book/123/chapter-content/ch01.html" => {
                        (200, "text/html", CH01_HTML.as_bytes().to_vec())
                    }
                    "/api/v1/book/123/chapter-content/ch02.html" => {
                        (200, "text/html", CH02_HTML.as_bytes().to_vec())
                    }
                    "/library/view/my-book/123/graphics/fig1.png" => {
                        (200, "image/png", FIG1_PNG.to_vec())
                    }
                    _ => (404, "text/plain", b"not found".to_vec()),
                };

                let response = tiny_http::Response::from_data(body)
                    .with_status_code(status)
                    .with_header(header("Content-Type", content_type));
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            requests,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// `METHOD /path?query` of every request received so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for BookStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn header(name: &str, value: &str) -> tiny_http::Header {
    tiny_http::Header::from_bytes(name.as_bytes(), value.as_bytes()).expect("build header")
}
