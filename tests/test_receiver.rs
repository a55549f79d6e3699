use quay::config::Config;
use quay::http::receiver::{ReceiveError, Receiver, Signal};
use quay::http::request::{Body, Method, Request};
use std::sync::Arc;
use tempfile::TempDir;

fn config_in(dir: &TempDir) -> Config {
    Config {
        upload_dir: dir.path().to_path_buf(),
        ..Config::default()
    }
}

fn receive_whole(config: Config, raw: &[u8]) -> Result<Request, ReceiveError> {
    let mut receiver = Receiver::new(Arc::new(config), "127.0.0.1");
    assert_eq!(receiver.feed(raw)?, Signal::Done);
    receiver.finish()
}

fn receive_bytewise(config: Config, raw: &[u8]) -> Result<Request, ReceiveError> {
    let mut receiver = Receiver::new(Arc::new(config), "127.0.0.1");
    let mut signal = Signal::NeedMoreData;
    for byte in raw {
        signal = receiver.feed(std::slice::from_ref(byte))?;
    }
    assert_eq!(signal, Signal::Done);
    receiver.finish()
}

fn multipart_request(boundary: &str, parts: &[(&str, Option<&str>, &str)]) -> Vec<u8> {
    let mut body = String::new();
    for (name, filename, content) in parts {
        body.push_str(&format!("--{boundary}\r\n"));
        match filename {
            Some(filename) => {
                body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n"
                ));
                body.push_str("Content-Type: text/plain\r\n\r\n");
            }
            None => {
                body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n"
                ));
            }
        }
        body.push_str(content);
        body.push_str("\r\n");
    }
    body.push_str(&format!("--{boundary}--\r\n"));

    format!(
        "POST /upload HTTP/1.1\r\nContent-Type: multipart/form-data; boundary={boundary}\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

#[test]
fn test_get_with_query_and_cookies() {
    let raw = b"GET /search?q=rust&page=2 HTTP/1.1\r\nHost: localhost\r\nCookie: session=abc; theme=dark\r\n\r\n";
    let req = receive_whole(Config::default(), raw).unwrap();

    assert_eq!(req.method, Method::GET);
    assert_eq!(req.path, "/search");
    assert_eq!(req.version, "HTTP/1.1");
    assert_eq!(req.query["q"].value().map(String::as_str), Some("rust"));
    assert_eq!(req.query["page"].value().map(String::as_str), Some("2"));
    assert_eq!(req.cookie("session"), Some("abc"));
    assert_eq!(req.cookie("theme"), Some("dark"));
    assert_eq!(req.header("host"), Some("localhost"));
    assert_eq!(req.client, "127.0.0.1");
    assert!(req.body.is_empty());
}

#[test]
fn test_json_body() {
    let raw = b"POST /api HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 13\r\n\r\n{\"a\":1,\"b\":2}";
    let req = receive_whole(Config::default(), raw).unwrap();

    assert_eq!(
        req.body.json(),
        Some(&serde_json::json!({ "a": 1, "b": 2 }))
    );
}

#[test]
fn test_json_body_split_across_reads() {
    let mut receiver = Receiver::new(Arc::new(Config::default()), "127.0.0.1");
    let head = b"POST /api HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 13\r\n\r\n{\"na";

    assert_eq!(receiver.feed(head).unwrap(), Signal::NeedMoreData);
    assert_eq!(receiver.feed(b"me\":\"ab\"}").unwrap(), Signal::Done);
    assert!(receiver.is_complete());
}

#[test]
fn test_invalid_json_is_rejected() {
    let raw = b"POST /api HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 5\r\n\r\n{nope";
    let err = receive_whole(Config::default(), raw).unwrap_err();
    assert!(matches!(err, ReceiveError::InvalidJson));
}

#[test]
fn test_urlencoded_body_with_brackets() {
    let body = "user%5Bname%5D=Ann&tags[]=a&tags[]=b&plain=x+y";
    let raw = format!(
        "POST /form HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    let req = receive_whole(Config::default(), raw.as_bytes()).unwrap();

    let Body::Fields(fields) = &req.body else {
        panic!("expected fields, got {:?}", req.body);
    };
    assert_eq!(
        serde_json::to_value(fields).unwrap(),
        serde_json::json!({
            "user": { "name": "Ann" },
            "tags": ["a", "b"],
            "plain": "x y",
        })
    );
}

#[test]
fn test_content_length_zero_gives_empty_body() {
    let raw = b"POST /api HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 0\r\n\r\n";
    let req = receive_whole(Config::default(), raw).unwrap();
    assert!(req.body.is_empty());
}

#[test]
fn test_body_longer_than_content_length() {
    let raw = b"POST /api HTTP/1.1\r\nContent-Length: 3\r\n\r\na=12345";
    let mut receiver = Receiver::new(Arc::new(Config::default()), "127.0.0.1");
    assert!(matches!(receiver.feed(raw), Err(ReceiveError::BodyTooLong)));
}

#[test]
fn test_non_numeric_content_length() {
    let raw = b"POST /api HTTP/1.1\r\nContent-Length: 12a\r\n\r\n";
    let mut receiver = Receiver::new(Arc::new(Config::default()), "127.0.0.1");
    assert!(matches!(
        receiver.feed(raw),
        Err(ReceiveError::InvalidContentLength)
    ));
}

#[test]
fn test_unknown_method() {
    let mut receiver = Receiver::new(Arc::new(Config::default()), "127.0.0.1");
    let err = receiver.feed(b"BREW /pot HTTP/1.1\r\n\r\n").unwrap_err();
    assert!(matches!(err, ReceiveError::UnknownMethod));
    assert_eq!(err.to_string(), "Unknown request method.");
}

#[test]
fn test_method_too_long() {
    let mut receiver = Receiver::new(Arc::new(Config::default()), "127.0.0.1");
    assert!(matches!(
        receiver.feed(b"GETGETGETGET / HTTP/1.1\r\n"),
        Err(ReceiveError::MethodTooLong)
    ));
}

#[test]
fn test_path_too_long() {
    let mut raw = b"GET /".to_vec();
    raw.extend(std::iter::repeat_n(b'a', 3000));
    let mut receiver = Receiver::new(Arc::new(Config::default()), "127.0.0.1");
    assert!(matches!(receiver.feed(&raw), Err(ReceiveError::PathTooLong)));
}

#[test]
fn test_headers_too_large_regardless_of_chunking() {
    let mut raw = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
    raw.extend(std::iter::repeat_n(b'a', 9000));

    let mut whole = Receiver::new(Arc::new(Config::default()), "127.0.0.1");
    assert!(matches!(whole.feed(&raw), Err(ReceiveError::HeadersTooLarge)));

    let mut chunked = Receiver::new(Arc::new(Config::default()), "127.0.0.1");
    let result = raw
        .chunks(7)
        .map(|chunk| chunked.feed(chunk))
        .find(|r| r.is_err());
    assert!(matches!(result, Some(Err(ReceiveError::HeadersTooLarge))));
}

#[test]
fn test_multipart_fields_and_file() {
    let dir = TempDir::new().unwrap();
    let raw = multipart_request(
        "XyZ123",
        &[
            ("title", None, "Hello"),
            ("tags[]", None, "a"),
            ("tags[]", None, "b"),
            ("doc", Some("notes.txt"), "line one\r\nline two"),
        ],
    );
    let req = receive_whole(config_in(&dir), &raw).unwrap();

    let fields = req.body.fields().expect("fields body");
    assert_eq!(fields["title"].value().map(String::as_str), Some("Hello"));
    assert_eq!(fields["tags"].items().map(|i| i.len()), Some(2));

    let doc = req.files["doc"].value().expect("file descriptor");
    assert_eq!(doc.real, "notes.txt");
    assert_eq!(doc.ext, ".txt");
    assert_eq!(doc.mime, "text/plain");
    assert_eq!(doc.size, "line one\r\nline two".len());
    assert!(doc.path.starts_with(dir.path()));
    assert_eq!(
        std::fs::read(&doc.path).unwrap(),
        b"line one\r\nline two".to_vec()
    );
}

#[test]
fn test_multipart_is_chunking_invariant() {
    let whole_dir = TempDir::new().unwrap();
    let byte_dir = TempDir::new().unwrap();
    let parts = [
        ("a", None, "first"),
        ("nested[key]", None, "value with \r\n-- inside"),
        ("upload", Some("data.bin"), "\r\n--XyZ12 almost a boundary\r\n"),
    ];
    let raw = multipart_request("XyZ123", &parts);

    let whole = receive_whole(config_in(&whole_dir), &raw).unwrap();
    let bytewise = receive_bytewise(config_in(&byte_dir), &raw).unwrap();

    assert_eq!(whole.body, bytewise.body);
    let whole_file = whole.files["upload"].value().unwrap();
    let byte_file = bytewise.files["upload"].value().unwrap();
    assert_eq!(whole_file.size, byte_file.size);
    assert_eq!(
        std::fs::read(&whole_file.path).unwrap(),
        std::fs::read(&byte_file.path).unwrap()
    );
    assert_eq!(
        std::fs::read(&byte_file.path).unwrap(),
        b"\r\n--XyZ12 almost a boundary\r\n".to_vec()
    );
}

#[test]
fn test_too_many_fields() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        max_fields: 2,
        ..config_in(&dir)
    };
    let raw = multipart_request("b0undary", &[("a", None, "1"), ("b", None, "2"), ("c", None, "3")]);

    let err = receive_whole(config, &raw).unwrap_err();
    assert!(matches!(err, ReceiveError::TooManyFields));
    assert_eq!(
        err.to_string(),
        "The maximum number of fields has been exceeded."
    );
}

#[test]
fn test_repeated_list_names_count_once() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        max_fields: 1,
        ..config_in(&dir)
    };
    let raw = multipart_request("b0undary", &[("x[]", None, "1"), ("x[]", None, "2")]);
    assert!(receive_whole(config, &raw).is_ok());
}

#[test]
fn test_empty_file_rejected_and_discarded() {
    let dir = TempDir::new().unwrap();
    let raw = multipart_request("b0undary", &[("doc", Some("empty.txt"), "")]);

    let mut receiver = Receiver::new(Arc::new(config_in(&dir)), "127.0.0.1");
    let err = receiver.feed(&raw).unwrap_err();
    assert!(matches!(err, ReceiveError::EmptyFile));
    assert_eq!(receiver.uploads().len(), 1);

    receiver.discard_uploads();
    assert!(receiver.uploads().is_empty());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_empty_file_allowed_by_config() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        allow_empty_files: true,
        ..config_in(&dir)
    };
    let raw = multipart_request("b0undary", &[("doc", Some("empty.txt"), "")]);
    let req = receive_whole(config, &raw).unwrap();
    assert_eq!(req.files["doc"].value().map(|f| f.size), Some(0));
}

#[test]
fn test_file_too_large() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        max_file_size_mb: 1,
        ..config_in(&dir)
    };
    let content = "x".repeat(1024 * 1024 + 1);
    let raw = multipart_request("b0undary", &[("doc", Some("big.txt"), &content)]);

    let err = receive_whole(config, &raw).unwrap_err();
    assert!(matches!(err, ReceiveError::FileTooLarge));
}

#[test]
fn test_too_many_files() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        max_files: 1,
        ..config_in(&dir)
    };
    let raw = multipart_request(
        "b0undary",
        &[("a", Some("a.txt"), "1"), ("b", Some("b.txt"), "2")],
    );
    let err = receive_whole(config, &raw).unwrap_err();
    assert!(matches!(err, ReceiveError::TooManyFiles));
}

#[test]
fn test_empty_filename_is_a_text_field() {
    let dir = TempDir::new().unwrap();
    let raw = multipart_request("b0undary", &[("doc", Some(""), "")]);
    let req = receive_whole(config_in(&dir), &raw).unwrap();

    assert!(req.files.is_empty());
    assert_eq!(
        req.body.fields().and_then(|f| f["doc"].value()).map(String::as_str),
        Some("")
    );
}

#[test]
fn test_missing_closing_boundary() {
    let dir = TempDir::new().unwrap();
    let body = "--b0undary\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nvalue";
    let raw = format!(
        "POST /upload HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=b0undary\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    let mut receiver = Receiver::new(Arc::new(config_in(&dir)), "127.0.0.1");
    assert!(matches!(
        receiver.feed(raw.as_bytes()),
        Err(ReceiveError::InvalidBoundary)
    ));
}

#[test]
fn test_finish_before_complete_fails() {
    let mut receiver = Receiver::new(Arc::new(Config::default()), "127.0.0.1");
    assert_eq!(receiver.feed(b"GET / HT").unwrap(), Signal::NeedMoreData);
    assert!(receiver.finish().is_err());
}

#[test]
fn test_dropping_unfinished_receiver_removes_uploads() {
    let dir = TempDir::new().unwrap();
    let head = "POST /upload HTTP/1.1\r\n\
                Content-Type: multipart/form-data; boundary=sep\r\n\
                Content-Length: 1000\r\n\r\n\
                --sep\r\n\
                Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\r\n\
                partial-data";

    let mut receiver = Receiver::new(Arc::new(config_in(&dir)), "127.0.0.1");
    assert_eq!(receiver.feed(head.as_bytes()).unwrap(), Signal::NeedMoreData);
    assert_eq!(receiver.uploads().len(), 1);

    drop(receiver);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_finished_request_keeps_uploads() {
    let dir = TempDir::new().unwrap();
    let raw = multipart_request("b0undary", &[("doc", Some("a.txt"), "kept")]);

    let mut receiver = Receiver::new(Arc::new(config_in(&dir)), "127.0.0.1");
    assert_eq!(receiver.feed(&raw).unwrap(), Signal::Done);
    let req = receiver.finish().unwrap();
    drop(receiver);

    let doc = req.files["doc"].value().unwrap();
    assert_eq!(std::fs::read(&doc.path).unwrap(), b"kept".to_vec());
}

#[test]
fn test_urlencoded_body_over_fields_quota() {
    let config = Config {
        max_fields_size_total_mb: 1,
        ..Config::default()
    };
    let body = format!("a={}", "x".repeat(5 * 1024 * 1024));
    let raw = format!(
        "POST /form HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );

    let err = receive_whole(config, raw.as_bytes()).unwrap_err();
    assert!(matches!(err, ReceiveError::FieldsTooLarge));
    assert_eq!(err.to_string(), "The maximum size of fields has been exceeded.");
}
