use minicat::{
    limits::{ConnLimits, ServerLimits},
    ErrorReportValve, Exchange, Next, Pipeline, PipelineAdapter, Server, ServerHandle, Valve,
};
use std::{
    io::{self, BufRead, BufReader, Read, Write},
    net::TcpStream,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

struct Routes;

impl Valve for Routes {
    fn invoke(&self, exchange: &mut Exchange<'_>, _: Next<'_>) -> anyhow::Result<()> {
        match exchange.request().uri() {
            "/" => {
                exchange.response_mut().set_content_length(2);
                exchange.write_body(b"ok")?;
            }
            "/empty" => {
                exchange.response_mut().set_status(204u16);
                exchange.write_body(b"dropped")?;
            }
            "/echo" => {
                let mut body = Vec::new();
                let mut buf = [0; 4096];
                loop {
                    let n = exchange.read_body(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    body.extend_from_slice(&buf[..n]);
                }
                // no length: sent chunked
                exchange.write_body(&body)?;
            }
            _ => {
                exchange.response_mut().set_status(404u16);
            }
        }
        Ok(())
    }
}

fn start(server: ServerLimits, connection: ConnLimits) -> ServerHandle {
    let mut pipeline = Pipeline::new();
    pipeline
        .set_basic(Arc::new(Routes))
        .add_valve(Arc::new(ErrorReportValve));

    Server::builder()
        .server_limits(ServerLimits {
            address: "127.0.0.1:0".parse().unwrap(),
            accept_timeout: Duration::from_millis(50),
            poll_timeout: Duration::from_millis(50),
            ..server
        })
        .connection_limits(connection)
        .adapter(Arc::new(PipelineAdapter::new(pipeline)))
        .build()
        .launch()
        .unwrap()
}

fn connect(handle: &ServerHandle) -> BufReader<TcpStream> {
    let stream = TcpStream::connect(handle.local_addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    BufReader::new(stream)
}

fn send(reader: &mut BufReader<TcpStream>, request: &str) {
    reader.get_mut().write_all(request.as_bytes()).unwrap();
}

/// Reads one response: head and decoded body.
fn read_response(reader: &mut BufReader<TcpStream>) -> io::Result<(String, Vec<u8>)> {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        if line == "\r\n" {
            break;
        }
        head.push_str(&line);
    }

    let mut body = Vec::new();
    if head.contains("Transfer-Encoding: chunked\r\n") {
        loop {
            let mut size = String::new();
            reader.read_line(&mut size)?;
            let size = usize::from_str_radix(size.trim(), 16).unwrap();
            let mut chunk = vec![0; size + 2];
            reader.read_exact(&mut chunk)?;
            if size == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..size]);
        }
    } else if let Some(len) = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
    {
        body.resize(len.trim().parse().unwrap(), 0);
        reader.read_exact(&mut body)?;
    }
    Ok((head, body))
}

fn is_closed(reader: &mut BufReader<TcpStream>) -> bool {
    matches!(reader.read(&mut [0; 1]), Ok(0) | Err(_))
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn simple_get() {
    let handle = start(ServerLimits::default(), ConnLimits::default());
    let mut client = connect(&handle);

    send(&mut client, "GET / HTTP/1.1\r\nHost: h\r\n\r\n");
    let (head, body) = read_response(&mut client).unwrap();

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Connection: close\r\n"));
    assert_eq!(body, b"ok");
    assert!(is_closed(&mut client));

    handle.shutdown();
}

#[test]
fn keep_alive_is_bounded() {
    let handle = start(ServerLimits::default(), ConnLimits::default());
    let mut client = connect(&handle);

    for i in 1..=10 {
        send(&mut client, "GET / HTTP/1.1\r\nHost: h\r\nConnection: keep-alive\r\n\r\n");
        let (head, body) = read_response(&mut client).unwrap();
        assert_eq!(body, b"ok");
        assert_eq!(head.contains("Connection: close"), i == 10, "request {i}");
    }

    let _ = client
        .get_mut()
        .write_all(b"GET / HTTP/1.1\r\nHost: h\r\nConnection: keep-alive\r\n\r\n");
    assert!(is_closed(&mut client));

    handle.shutdown();
}

#[test]
fn no_entity_body_for_204() {
    let handle = start(ServerLimits::default(), ConnLimits::default());
    let mut client = connect(&handle);

    send(&mut client, "GET /empty HTTP/1.1\r\nHost: h\r\nConnection: keep-alive\r\n\r\n");
    let (head, body) = read_response(&mut client).unwrap();
    assert!(head.starts_with("HTTP/1.1 204 No Content\r\n"));
    assert!(!head.contains("Content-Length"));
    assert!(!head.contains("Transfer-Encoding"));
    assert!(body.is_empty());

    // the connection is still usable, nothing stray was written
    send(&mut client, "GET /missing HTTP/1.1\r\nHost: h\r\nConnection: keep-alive\r\n\r\n");
    let (head, body) = read_response(&mut client).unwrap();
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(String::from_utf8(body).unwrap().contains("HTTP Status 404 - Not Found"));

    handle.shutdown();
}

#[test]
fn chunked_body_arriving_late() {
    let handle = start(ServerLimits::default(), ConnLimits::default());
    let mut client = connect(&handle);

    send(
        &mut client,
        "POST /echo HTTP/1.1\r\nHost: h\r\nConnection: keep-alive\r\nTransfer-Encoding: chunked\r\n\r\n",
    );
    // the worker parks on a blocking read until the poller sees the body
    thread::sleep(Duration::from_millis(100));
    send(&mut client, "4\r\nWiki\r\n");
    thread::sleep(Duration::from_millis(50));
    send(&mut client, "5\r\npedia\r\n0\r\n\r\n");

    let (head, body) = read_response(&mut client).unwrap();
    assert!(head.contains("Transfer-Encoding: chunked\r\n"));
    assert_eq!(body, b"Wikipedia");

    handle.shutdown();
}

#[test]
fn malformed_request_is_rejected() {
    let handle = start(ServerLimits::default(), ConnLimits::default());
    let mut client = connect(&handle);

    send(&mut client, "GET / HTTP/1.1\r\nno colon here\r\n\r\n");
    let (head, _) = read_response(&mut client).unwrap();
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(is_closed(&mut client));

    handle.shutdown();
}

#[test]
fn third_connection_waits_for_a_slot() {
    let handle = start(
        ServerLimits {
            max_connections: 2,
            ..ServerLimits::default()
        },
        ConnLimits::default(),
    );

    let first = connect(&handle);
    let _second = connect(&handle);
    assert!(wait_for(|| handle.available_slots() == Some(0)));

    let mut third = connect(&handle);
    send(&mut third, "GET / HTTP/1.1\r\nHost: h\r\n\r\n");
    third
        .get_ref()
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    assert!(read_response(&mut third).is_err());

    drop(first);
    third
        .get_ref()
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let (head, body) = read_response(&mut third).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"ok");

    handle.shutdown();
}

#[test]
fn idle_connection_is_evicted_once() {
    let handle = start(
        ServerLimits {
            max_connections: 1,
            sweep_interval: Duration::from_millis(50),
            ..ServerLimits::default()
        },
        ConnLimits {
            socket_timeout: Duration::from_millis(200),
            ..ConnLimits::default()
        },
    );

    let mut idle = connect(&handle);
    thread::sleep(Duration::from_millis(100));

    // served only once the idle connection gave its slot back
    let started = Instant::now();
    let mut waiting = connect(&handle);
    send(&mut waiting, "GET / HTTP/1.1\r\nHost: h\r\n\r\n");
    let (head, _) = read_response(&mut waiting).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(is_closed(&mut idle));

    // the slot is still usable after both connections are gone
    assert!(is_closed(&mut waiting));
    let mut next = connect(&handle);
    send(&mut next, "GET / HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(read_response(&mut next).is_ok());

    handle.shutdown();
}

#[test]
fn full_worker_queue_drops_the_connection() {
    let handle = start(
        ServerLimits {
            max_connections: 4,
            worker_threads: 1,
            worker_queue: 1,
            ..ServerLimits::default()
        },
        ConnLimits::default(),
    );

    // the only worker parks waiting for a body
    let mut busy = connect(&handle);
    send(&mut busy, "POST /echo HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\n");
    thread::sleep(Duration::from_millis(100));

    // fills the queue
    let mut queued = connect(&handle);
    send(&mut queued, "GET / HTTP/1.1\r\nHost: h\r\n\r\n");
    thread::sleep(Duration::from_millis(100));

    let mut rejected = connect(&handle);
    send(&mut rejected, "GET / HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(is_closed(&mut rejected));
    assert!(wait_for(|| handle.available_slots() >= Some(1)));

    send(&mut busy, "hello");
    let (_, body) = read_response(&mut busy).unwrap();
    assert_eq!(body, b"hello");
    let (head, body) = read_response(&mut queued).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"ok");

    let mut next = connect(&handle);
    send(&mut next, "GET / HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(read_response(&mut next).is_ok());
    assert!(wait_for(|| handle.available_slots() >= Some(3)));

    handle.shutdown();
}
