mod util;

use std::io::{Read, Write};
use std::thread::sleep;
use std::time::Duration;

use util::{parse, spawn_server, Response, Server};

#[test]
fn serves_static_file() {
    let server = Server::start(|_| String::new());
    server.create_file("index.html", b"<h1>ok</h1>\n");

    let response = server.raw("GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let (status, headers, body) = parse(&response);
    assert!(status.contains("200 OK"));
    assert_eq!(headers.get("Content-Type"), Some(&"text/html"));
    assert_eq!(headers.get("Content-Length"), Some(&"12"));
    assert_eq!(body, "<h1>ok</h1>\n");
}

#[test]
fn missing_file_is_404() {
    let server = Server::start(|_| String::new());
    let response = server.raw("GET /missing HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let (status, _, _) = parse(&response);
    assert!(status.contains("404 Not Found"));
}

#[test]
fn head_keeps_content_length_and_drops_body() {
    let server = Server::start(|_| String::new());
    server.create_file("index.html", b"<h1>ok</h1>\n");

    let response = server.raw("HEAD /index.html HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let (status, headers, body) = parse(&response);
    assert!(status.contains("200 OK"));
    assert_eq!(headers.get("Content-Length"), Some(&"12"));
    assert!(body.is_empty());
}

#[test]
fn http11_without_host_is_400() {
    let server = Server::start(|_| String::new());
    let response = server.raw("GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
    let (status, _, _) = parse(&response);
    assert!(status.contains("400 Bad Request"));
}

#[test]
fn unknown_method_is_501() {
    let server = Server::start(|_| String::new());
    let response = server.raw("FOO / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let (status, _, _) = parse(&response);
    assert!(status.contains("501 Not Implemented"));
}

#[test]
fn disallowed_method_is_405() {
    let server = Server::start(|_| {
        "    location /ro {\n        allow_methods GET;\n    }".to_string()
    });
    let response = server.raw("DELETE /ro/x HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let (status, _, _) = parse(&response);
    assert!(status.contains("405 Method Not Allowed"));
}

#[test]
fn configured_redirect_is_followed() {
    let server = Server::start(|_| {
        "    location /old {\n        return 301 /new;\n    }".to_string()
    });
    let response = server.raw("GET /old HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let (status, headers, _) = parse(&response);
    assert!(status.contains("301 Moved Permanently"));
    assert_eq!(headers.get("Location"), Some(&"/new"));
}

#[test]
fn autoindex_lists_directory() {
    let server = Server::start(|root| {
        format!(
            "    location /files {{\n        allow_methods GET;\n        root {}/files;\n        autoindex on;\n    }}",
            root.display()
        )
    });
    server.create_dir("files");
    server.create_dir("files/sub");
    server.create_file("files/a.txt", b"alpha");

    let response = server.raw("GET /files/ HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let (status, _, body) = parse(&response);
    assert!(status.contains("200 OK"));
    assert!(body.contains("<a href=\"/files/sub/\""));
    assert!(body.contains("<a href=\"/files/a.txt\""));
}

#[test]
fn directory_without_index_or_autoindex_is_404() {
    let server = Server::start(|root| {
        format!(
            "    location /files {{\n        root {}/files;\n    }}",
            root.display()
        )
    });
    server.create_dir("files");
    let response = server.raw("GET /files/ HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let (status, _, _) = parse(&response);
    assert!(status.contains("404 Not Found"));
}

#[test]
fn configured_error_page_is_served() {
    let server = Server::start(|_| "    error_page 404 /custom404.html;".to_string());
    server.create_file("custom404.html", b"totally custom");
    let response = server.raw("GET /missing HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let (status, _, body) = parse(&response);
    assert!(status.contains("404 Not Found"));
    assert!(body.contains("totally custom"));
}

#[test]
fn oversized_declared_body_is_rejected_early() {
    let server = Server::start(|root| {
        format!(
            "    client_max_body_size 10;\n    location /up {{\n        allow_methods POST;\n        upload_store {}/store;\n    }}",
            root.display()
        )
    });
    server.create_dir("store");

    let mut stream = server.stream();
    stream
        .write_all(b"POST /up HTTP/1.1\r\nHost: x\r\nContent-Length: 1000000\r\nConnection: close\r\n\r\nxxxx")
        .unwrap();
    // The 413 must arrive long before a megabyte could have been sent.
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).expect("no response received");
    let response = String::from_utf8_lossy(&buf);
    assert!(response.contains("413 Request Entity Too Large"));
}

#[test]
fn oversized_chunked_body_is_rejected_mid_stream() {
    let server = Server::start(|root| {
        format!(
            "    client_max_body_size 10;\n    location /up {{\n        allow_methods POST;\n        upload_store {}/store;\n    }}",
            root.display()
        )
    });
    server.create_dir("store");

    // One complete 20-byte chunk, no terminating chunk: the cap must fire
    // without waiting for the end of the stream.
    let mut stream = server.stream();
    stream
        .write_all(
            b"POST /up HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
            14\r\naaaaaaaaaaaaaaaaaaaa\r\n",
        )
        .unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).expect("no response received");
    let response = String::from_utf8_lossy(&buf);
    assert!(response.contains("413 Request Entity Too Large"));
}

#[test]
fn post_without_content_length_is_411() {
    let server = Server::start(|root| {
        format!(
            "    location /up {{\n        allow_methods POST;\n        upload_store {}/store;\n    }}",
            root.display()
        )
    });
    server.create_dir("store");
    let response = server.raw("POST /up HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let (status, _, _) = parse(&response);
    assert!(status.contains("411 Length Required"));
}

#[test]
fn post_without_upload_store_is_403() {
    let server = Server::start(|_| {
        "    location /up {\n        allow_methods POST;\n    }".to_string()
    });
    let response = server
        .raw("POST /up HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi");
    let (status, _, _) = parse(&response);
    assert!(status.contains("403 Forbidden"));
}

fn upload_server() -> Server {
    let server = Server::start(|root| {
        format!(
            "    location /up {{\n        allow_methods GET POST PUT;\n        upload_store {}/store;\n    }}",
            root.display()
        )
    });
    server.create_dir("store");
    server
}

/// Name reported in an upload's 201 body.
fn uploaded_name(body: &str) -> String {
    let after = body.split("File uploaded: ").nth(1).expect("no filename in body");
    after.split('<').next().unwrap().to_string()
}

#[test]
fn raw_upload_round_trips_through_get() {
    let server = upload_server();
    let payload = "hello upload";
    let request = format!(
        "POST /up HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        payload.len(),
        payload
    );
    let response = server.raw(&request);
    let (status, _, body) = parse(&response);
    assert!(status.contains("201 Created"));

    let name = uploaded_name(body);
    let fetched = server.raw(&format!(
        "GET /store/{} HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        name
    ));
    let (status, _, body) = parse(&fetched);
    assert!(status.contains("200 OK"));
    assert_eq!(body, payload);
}

#[test]
fn multipart_upload_keeps_filename_and_content() {
    let server = upload_server();
    let boundary = "XYZTEST";
    let body = format!(
        "--{b}\r\n\
        Content-Disposition: form-data; name=\"file\"; filename=\"hello.txt\"\r\n\
        Content-Type: text/plain\r\n\r\n\
        hi there\r\n\
        --{b}--\r\n",
        b = boundary
    );
    let request = format!(
        "POST /up HTTP/1.1\r\nHost: x\r\n\
        Content-Type: multipart/form-data; boundary={}\r\n\
        Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        boundary,
        body.len(),
        body
    );
    let response = server.raw(&request);
    let (status, _, body) = parse(&response);
    assert!(status.contains("201 Created"));
    assert!(body.contains("File uploaded: hello.txt"));

    let fetched =
        server.raw("GET /store/hello.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let (status, _, body) = parse(&fetched);
    assert!(status.contains("200 OK"));
    assert_eq!(body, "hi there");
}

#[test]
fn put_then_delete_then_get_is_404() {
    let server = upload_server();

    let created = server.raw(
        "PUT /up/note.txt HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\nConnection: close\r\n\r\nv1",
    );
    let (status, _, _) = parse(&created);
    assert!(status.contains("201 Created"));

    let fetched = server.raw("GET /store/note.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let (status, _, body) = parse(&fetched);
    assert!(status.contains("200 OK"));
    assert_eq!(body, "v1");

    let overwritten = server.raw(
        "PUT /up/note.txt HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\nConnection: close\r\n\r\nv2",
    );
    let (status, _, _) = parse(&overwritten);
    assert!(status.contains("204 No Content"));

    let deleted =
        server.raw("DELETE /store/note.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let (status, _, _) = parse(&deleted);
    assert!(status.contains("200 OK"));

    let gone = server.raw("GET /store/note.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let (status, _, _) = parse(&gone);
    assert!(status.contains("404 Not Found"));
}

#[test]
fn delete_on_directory_is_405() {
    let server = Server::start(|_| String::new());
    server.create_dir("somedir");
    let response = server.raw("DELETE /somedir HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let (status, _, _) = parse(&response);
    assert!(status.contains("405 Method Not Allowed"));
}

#[test]
fn keep_alive_reuses_the_connection() {
    let server = Server::start(|_| String::new());
    server.create_file("index.html", b"<h1>ok</h1>\n");

    let mut stream = server.stream();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let first = Response::from_reader(&mut stream).unwrap();
    assert!(first.status_line.contains("200 OK"));
    assert_eq!(first.header("Connection"), Some("keep-alive"));

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let second = Response::from_reader(&mut stream).unwrap();
    assert!(second.status_line.contains("200 OK"));
    assert_eq!(second.body_str(), "<h1>ok</h1>\n");
}

#[test]
fn duplicate_binding_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let port = util::get_unused_port();
    let config = format!(
        "server {{\n    listen 127.0.0.1:{p};\n}}\nserver {{\n    listen 127.0.0.1:{p};\n}}\n",
        p = port
    );
    let config_path = dir.path().join("dup.conf");
    std::fs::write(&config_path, config).unwrap();

    let mut child = spawn_server(&config_path);
    let mut status = None;
    for _ in 0..300 {
        if let Some(exit) = child.try_wait().unwrap() {
            status = Some(exit);
            break;
        }
        sleep(Duration::from_millis(10));
    }
    let status = status.expect("server kept running with a duplicate binding");
    assert_eq!(status.code(), Some(1));
}

#[test]
fn two_endpoints_serve_their_own_roots() {
    let dir = tempfile::tempdir().unwrap();
    let root_one = dir.path().join("one");
    let root_two = dir.path().join("two");
    std::fs::create_dir_all(&root_one).unwrap();
    std::fs::create_dir_all(&root_two).unwrap();
    std::fs::write(root_one.join("index.html"), b"one").unwrap();
    std::fs::write(root_two.join("index.html"), b"two").unwrap();

    let port_one = util::get_unused_port();
    let port_two = util::get_unused_port();
    let config = format!(
        "server {{\n    listen 127.0.0.1:{};\n    root {};\n}}\n\
         server {{\n    listen 127.0.0.1:{};\n    root {};\n}}\n",
        port_one,
        root_one.display(),
        port_two,
        root_two.display(),
    );
    let config_path = dir.path().join("multi.conf");
    std::fs::write(&config_path, config).unwrap();
    let _child = util::ScopedChild(spawn_server(&config_path));
    assert!(util::wait_for_port(port_one));
    assert!(util::wait_for_port(port_two));

    for (port, expected) in [(port_one, "one"), (port_two, "two")] {
        let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).unwrap();
        let response = String::from_utf8_lossy(&buf);
        let (status, _, body) = parse(&response);
        assert!(status.contains("200 OK"));
        assert_eq!(body, expected);
    }
}

/// CGI fixture: each extension maps to its own executable "interpreter"
/// script, exercising the parallel cgi_ext/cgi_path arrays.
fn cgi_server() -> Server {
    let server = Server::start(|root| {
        let cgi = format!("{}/cgi", root.display());
        format!(
            "    location /cgi {{\n\
            \x20       allow_methods GET POST;\n\
            \x20       root {cgi};\n\
            \x20       cgi_ext .sh .cat .env .stat;\n\
            \x20       cgi_path {cgi}/echo.sh {cgi}/cat.sh {cgi}/env.sh {cgi}/status.sh;\n\
            \x20   }}",
            cgi = cgi
        )
    });
    server.create_dir("cgi");
    server.create_executable(
        "cgi/echo.sh",
        "#!/bin/sh\nprintf 'Content-Type: text/plain\\r\\n\\r\\nhello\\n'\n",
    );
    server.create_executable(
        "cgi/cat.sh",
        "#!/bin/sh\nprintf 'Content-Type: text/plain\\r\\n\\r\\n'\nexec /bin/cat\n",
    );
    server.create_executable(
        "cgi/env.sh",
        "#!/bin/sh\nprintf 'Content-Type: text/plain\\r\\n\\r\\n%s|%s' \"$PATH_INFO\" \"$QUERY_STRING\"\n",
    );
    server.create_executable(
        "cgi/status.sh",
        "#!/bin/sh\nprintf 'Status: 404 Gone Fishing\\r\\nContent-Type: text/plain\\r\\n\\r\\nnope'\n",
    );
    // Placeholder scripts resolved by the request path.
    server.create_file("cgi/script.cat", b"");
    server.create_file("cgi/script.env", b"");
    server.create_file("cgi/script.stat", b"");
    server
}

#[test]
fn cgi_get_produces_response() {
    let server = cgi_server();
    let response = server.raw("GET /cgi/echo.sh HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let (status, headers, body) = parse(&response);
    assert!(status.contains("200 OK"));
    assert_eq!(headers.get("Content-Type"), Some(&"text/plain"));
    assert_eq!(headers.get("Content-Length"), Some(&"6"));
    assert_eq!(body, "hello\n");
}

#[test]
fn cgi_post_body_reaches_stdin() {
    let server = cgi_server();
    let response = server.raw(
        "POST /cgi/script.cat HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\nConnection: close\r\n\r\nping",
    );
    let (status, _, body) = parse(&response);
    assert!(status.contains("200 OK"));
    assert_eq!(body, "ping");
}

#[test]
fn cgi_chunked_post_is_decoded() {
    let server = cgi_server();
    let response = server.raw(
        "POST /cgi/script.cat HTTP/1.1\r\nHost: x\r\n\
        Transfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
        4\r\nping\r\n0\r\n\r\n",
    );
    let (status, _, body) = parse(&response);
    assert!(status.contains("200 OK"));
    assert_eq!(body, "ping");
}

#[test]
fn cgi_path_info_falls_back_to_script_name() {
    let server = cgi_server();
    let response =
        server.raw("GET /cgi/script.env?a=1 HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let (status, _, body) = parse(&response);
    assert!(status.contains("200 OK"));
    assert_eq!(body, "/cgi/script.env|a=1");
}

#[test]
fn cgi_extra_path_becomes_path_info() {
    let server = cgi_server();
    let response = server
        .raw("GET /cgi/script.env/extra/bits HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let (status, _, body) = parse(&response);
    assert!(status.contains("200 OK"));
    assert_eq!(body, "/extra/bits|");
}

#[test]
fn cgi_status_header_overrides_code() {
    let server = cgi_server();
    let response =
        server.raw("GET /cgi/script.stat HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let (status, _, body) = parse(&response);
    assert!(status.contains("404 Gone Fishing"));
    assert_eq!(body, "nope");
}

#[test]
fn missing_cgi_script_is_404() {
    let server = cgi_server();
    let response =
        server.raw("GET /cgi/absent.sh HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let (status, _, _) = parse(&response);
    assert!(status.contains("404 Not Found"));
}

/// Takes a bit over 30 seconds; run with --ignored to exercise the CGI
/// timeout end to end.
#[test]
#[ignore]
fn cgi_timeout_kills_the_child() {
    let server = Server::start(|root| {
        let cgi = format!("{}/cgi", root.display());
        format!(
            "    location /cgi {{\n\
            \x20       allow_methods GET;\n\
            \x20       root {cgi};\n\
            \x20       cgi_ext .sh;\n\
            \x20       cgi_path {cgi}/sleep.sh;\n\
            \x20   }}",
            cgi = cgi
        )
    });
    server.create_dir("cgi");
    server.create_executable("cgi/sleep.sh", "#!/bin/sh\n/bin/sleep 60\n");

    let mut stream = server.stream();
    stream
        .set_read_timeout(Some(Duration::from_secs(35)))
        .unwrap();
    stream
        .write_all(b"GET /cgi/sleep.sh HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).unwrap();
    let response = String::from_utf8_lossy(&buf);
    assert!(response.contains("504 Gateway Timeout"));
}
