//! Integration tests: the client against scripted RTSP servers on loopback.
//!
//! Each mock accepts one connection at a time, parses requests with the
//! crate's own message parser and lets the test decide what to write back.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use rtsp::protocol::{Message, Method, Parsed};
use rtsp::transport::MediaTransport;
use rtsp::{Client, ClientConfig, RtspError};

const SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=Test\r\n\
t=0 0\r\n\
a=control:*\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=control:trackID=0\r\n";

/// Write a response to `request`. `head` is the status plus any extra
/// header lines.
fn reply(stream: &mut TcpStream, request: &Message, head: &str, body: &str) {
    let mut text = format!("RTSP/1.0 {}\r\nCSeq: {}\r\n", head, request.cseq().unwrap_or(0));
    if !body.is_empty() {
        text.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    text.push_str("\r\n");
    text.push_str(body);
    stream.write_all(text.as_bytes()).unwrap();
}

/// RTP packet with the marker bit set, framed for channel 0.
fn interleaved_packet(sequence_number: u16, timestamp: u32) -> Vec<u8> {
    let mut rtp = vec![0x80, 0xE0];
    rtp.extend_from_slice(&sequence_number.to_be_bytes());
    rtp.extend_from_slice(&timestamp.to_be_bytes());
    rtp.extend_from_slice(&0x1122_3344u32.to_be_bytes());
    rtp.extend_from_slice(b"frame");
    let mut framed = vec![b'$', 0];
    framed.extend_from_slice(&(rtp.len() as u16).to_be_bytes());
    framed.extend_from_slice(&rtp);
    framed
}

/// Serve `connections` TCP connections in turn, handing every request to
/// `handle` with the connection index. Returns everything received.
fn mock<F>(connections: usize, mut handle: F) -> (String, thread::JoinHandle<Vec<Message>>)
where
    F: FnMut(usize, &Message, &mut TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let authority = listener.local_addr().unwrap().to_string();
    let server = thread::spawn(move || {
        let mut received = Vec::new();
        for index in 0..connections {
            let (mut stream, _) = listener.accept().unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
            let mut pending = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                pending.extend_from_slice(&buf[..n]);
                while let Ok(Parsed::Complete(message, used)) = Message::parse(&pending) {
                    pending.drain(..used);
                    if message.is_request() {
                        handle(index, &message, &mut stream);
                    }
                    received.push(message);
                }
            }
        }
        received
    });
    (authority, server)
}

fn quiet_config() -> ClientConfig {
    ClientConfig {
        keep_alive: false,
        alternate_transport: false,
        read_timeout: Duration::from_millis(500),
        ..ClientConfig::default()
    }
}

fn describe_setup_play(request: &Message, stream: &mut TcpStream) {
    match request.method() {
        Some(Method::Options) => reply(
            stream,
            request,
            "200 OK\r\nPublic: OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN, GET_PARAMETER",
            "",
        ),
        Some(Method::Describe) => reply(stream, request, "200 OK\r\nContent-Type: application/sdp", SDP),
        Some(Method::Setup) => reply(
            stream,
            request,
            "200 OK\r\nSession: 1234;timeout=60\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1",
            "",
        ),
        Some(Method::Play) => reply(stream, request, "200 OK\r\nSession: 1234\r\nRange: npt=0-", ""),
        _ => reply(stream, request, "200 OK", ""),
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

#[test]
fn plays_interleaved_presentation_and_tears_down_on_close() {
    let (authority, server) = mock(1, |_, request, stream| {
        describe_setup_play(request, stream);
        if request.method() == Some(&Method::Play) {
            stream.write_all(&interleaved_packet(1, 100)).unwrap();
            stream.write_all(&interleaved_packet(2, 200)).unwrap();
        }
    });
    let config = ClientConfig {
        media_transport: MediaTransport::Interleaved,
        ..quiet_config()
    };
    let client = Client::new(&format!("rtsp://{authority}/live"), config).unwrap();
    client.start_playing(None).unwrap();
    assert!(client.is_playing());
    assert!(client.supported_methods().contains(&Method::GetParameter));

    let mut frames = Vec::new();
    assert!(wait_until(Duration::from_secs(3), || {
        frames.extend(client.frames());
        frames.len() >= 2
    }));
    assert!(frames.iter().all(|(control, _)| control.ends_with("/live/trackID=0")));
    assert_eq!(frames[0].1.timestamp(), Some(100));
    assert_eq!(frames[1].1.count(), 1);

    client.close();
    let received = server.join().unwrap();
    let methods: Vec<_> = received.iter().filter_map(|m| m.method().cloned()).collect();
    assert_eq!(
        methods,
        vec![Method::Options, Method::Describe, Method::Setup, Method::Play, Method::Teardown]
    );
    let cseqs: Vec<_> = received.iter().filter_map(|m| m.cseq()).collect();
    assert_eq!(cseqs, vec![1, 2, 3, 4, 5]);
    assert_eq!(received[3].header("Session"), Some("1234"));
    assert_eq!(received[4].header("Session"), Some("1234"));
}

#[test]
fn server_teardown_ends_playback() {
    let (authority, server) = mock(1, |_, request, stream| {
        describe_setup_play(request, stream);
        if request.method() == Some(&Method::Play) {
            let uri = request.uri().unwrap_or("*").to_string();
            let push = format!("TEARDOWN {uri} RTSP/1.0\r\nCSeq: 1\r\nSession: 1234\r\n\r\n");
            stream.write_all(push.as_bytes()).unwrap();
        }
    });
    let config = ClientConfig {
        media_transport: MediaTransport::Interleaved,
        ..quiet_config()
    };
    let client = Client::new(&format!("rtsp://{authority}/live"), config).unwrap();
    client.start_playing(None).unwrap();

    assert!(wait_until(Duration::from_secs(3), || client.sessions().is_empty()));
    assert!(!client.is_playing());

    client.close();
    let received = server.join().unwrap();
    let answer = received.iter().find(|m| m.is_response()).unwrap();
    assert_eq!(answer.status().map(|s| s.0), Some(200));
    assert_eq!(answer.cseq(), Some(1));
    assert!(!received.iter().any(|m| m.method() == Some(&Method::Teardown)));
}

#[test]
fn digest_challenge_is_answered_with_a_fresh_cseq() {
    let (authority, server) = mock(1, |_, request, stream| match request.header("Authorization") {
        None => reply(
            stream,
            request,
            "401 Unauthorized\r\nWWW-Authenticate: Digest realm=\"cam\", nonce=\"n0nce\"",
            "",
        ),
        Some(authorization) if authorization.contains("username=\"admin\"") => {
            reply(stream, request, "200 OK\r\nPublic: OPTIONS, DESCRIBE", "")
        }
        Some(_) => reply(stream, request, "403 Forbidden", ""),
    });
    let client = Client::new(&format!("rtsp://admin:secret@{authority}/live"), quiet_config()).unwrap();

    let response = client.options().unwrap();
    assert_eq!(response.status().map(|s| s.0), Some(200));
    client.close();

    let received = server.join().unwrap();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].cseq(), Some(1));
    assert_eq!(received[1].cseq(), Some(2));
    let authorization = received[1].header("Authorization").unwrap();
    assert!(authorization.starts_with("Digest "));
    assert!(authorization.contains("realm=\"cam\""));
    assert!(!received[1].uri().unwrap().contains("secret"));
}

#[test]
fn rejected_credentials_fail_without_looping() {
    let (authority, server) = mock(1, |_, request, stream| {
        reply(stream, request, "401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"cam\"", "");
    });
    let client = Client::new(&format!("rtsp://admin:wrong@{authority}/live"), quiet_config()).unwrap();

    assert!(matches!(client.options(), Err(RtspError::Authentication { .. })));
    client.close();
    assert_eq!(server.join().unwrap().len(), 2);
}

#[test]
fn redirect_moves_to_the_new_server() {
    let (target, target_server) = mock(1, |_, request, stream| describe_setup_play(request, stream));
    let location = format!("rtsp://{target}/moved");
    let (origin, origin_server) = mock(1, move |_, request, stream| {
        reply(stream, request, &format!("302 Found\r\nLocation: {location}"), "");
    });

    let client = Client::new(&format!("rtsp://{origin}/live"), quiet_config()).unwrap();
    let description = client.describe().unwrap();
    assert_eq!(description.media.len(), 1);
    assert_eq!(client.location().as_str(), format!("rtsp://{target}/moved"));
    client.close();

    assert_eq!(origin_server.join().unwrap().len(), 1);
    let moved = target_server.join().unwrap();
    assert_eq!(moved[0].uri(), Some(format!("rtsp://{target}/moved").as_str()));
}

#[test]
fn unsupported_transport_switches_to_interleaved() {
    let (authority, server) = mock(1, |_, request, stream| {
        let transport = request.header("Transport").unwrap_or_default();
        match request.method() {
            Some(Method::Setup) if !transport.contains("TCP") => {
                reply(stream, request, "461 Unsupported Transport", "")
            }
            _ => describe_setup_play(request, stream),
        }
    });
    let config = ClientConfig {
        first_udp_port: 43100,
        ..quiet_config()
    };
    let client = Client::new(&format!("rtsp://{authority}/live"), config).unwrap();
    let description = client.describe().unwrap();
    let negotiated = client.setup(&description.media[0]).unwrap();

    assert_eq!(negotiated.transport, MediaTransport::Interleaved);
    assert_eq!(client.media_transport(), MediaTransport::Interleaved);
    assert_eq!(client.sessions().len(), 1);
    client.close();

    let setups: Vec<_> = server
        .join()
        .unwrap()
        .into_iter()
        .filter(|m| m.method() == Some(&Method::Setup))
        .collect();
    assert_eq!(setups.len(), 2);
}

#[test]
fn repeated_transport_refusal_is_a_negotiation_fault() {
    let (authority, server) = mock(1, |_, request, stream| match request.method() {
        Some(Method::Setup) => reply(stream, request, "461 Unsupported Transport", ""),
        _ => describe_setup_play(request, stream),
    });
    let config = ClientConfig {
        first_udp_port: 43200,
        ..quiet_config()
    };
    let client = Client::new(&format!("rtsp://{authority}/live"), config).unwrap();
    let description = client.describe().unwrap();

    assert!(matches!(
        client.setup(&description.media[0]),
        Err(RtspError::Negotiation { .. })
    ));
    assert!(client.sessions().is_empty());
    client.close();

    let setups = server
        .join()
        .unwrap()
        .into_iter()
        .filter(|m| m.method() == Some(&Method::Setup))
        .count();
    assert_eq!(setups, 2);
}

#[test]
fn stalled_udp_media_falls_back_to_interleaved() {
    let (authority, server) = mock(1, |_, request, stream| {
        let transport = request.header("Transport").unwrap_or_default().to_string();
        match request.method() {
            Some(Method::Setup) if !transport.contains("TCP") => reply(
                stream,
                request,
                &format!("200 OK\r\nSession: 1234;timeout=60\r\nTransport: {transport};server_port=50000-50001"),
                "",
            ),
            _ => describe_setup_play(request, stream),
        }
    });
    let config = ClientConfig {
        first_udp_port: 43300,
        ..quiet_config()
    };
    let client = Client::new(&format!("rtsp://{authority}/live"), config).unwrap();
    let description = client.describe().unwrap();
    client.setup(&description.media[0]).unwrap();
    client.play(None).unwrap();
    assert_eq!(client.media_transport(), MediaTransport::Udp);

    assert_eq!(client.step_down_transport().unwrap(), Some(MediaTransport::Interleaved));
    assert_eq!(client.media_transport(), MediaTransport::Interleaved);
    assert!(client.is_playing());
    assert_eq!(client.contexts().len(), 1);
    assert!(client.contexts()[0].is_interleaved());
    client.close();

    let methods: Vec<_> = server
        .join()
        .unwrap()
        .iter()
        .filter_map(|m| m.method().cloned())
        .collect();
    assert_eq!(
        methods,
        vec![
            Method::Describe,
            Method::Setup,
            Method::Play,
            Method::Teardown,
            Method::Setup,
            Method::Play,
            Method::Teardown,
        ]
    );
}

#[test]
fn reconnects_once_after_the_server_drops_the_connection() {
    let (authority, server) = mock(2, |index, request, stream| {
        if index == 0 {
            stream.shutdown(std::net::Shutdown::Both).unwrap();
        } else {
            reply(stream, request, "200 OK", "");
        }
    });
    let client = Client::new(&format!("rtsp://{authority}/live"), quiet_config()).unwrap();

    let response = client.options().unwrap();
    assert_eq!(response.status().map(|s| s.0), Some(200));
    assert_eq!(client.stats().reconnects, 1);
    client.close();

    let received = server.join().unwrap();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].cseq(), received[1].cseq());
}

#[test]
fn silent_tcp_server_times_out_without_retransmitting() {
    let (authority, server) = mock(1, |_, _, _| {});
    let config = ClientConfig {
        read_timeout: Duration::from_millis(100),
        max_timeout: Duration::from_millis(400),
        max_attempts: 2,
        ..quiet_config()
    };
    let client = Client::new(&format!("rtsp://{authority}/live"), config).unwrap();

    match client.options() {
        Err(RtspError::Timeout { cseq, attempts, .. }) => {
            assert_eq!(cseq, 1);
            assert_eq!(attempts, 2);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    client.close();
    assert_eq!(server.join().unwrap().len(), 1);
}

#[test]
fn lost_udp_request_is_retransmitted_with_the_same_cseq() {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let authority = socket.local_addr().unwrap().to_string();
    let server = thread::spawn(move || {
        socket.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut buf = [0u8; 2048];
        let mut received = Vec::new();
        for attempt in 0..2 {
            let (n, peer) = socket.recv_from(&mut buf).unwrap();
            let Ok(Parsed::Complete(request, _)) = Message::parse(&buf[..n]) else {
                panic!("unparseable request");
            };
            if attempt == 1 {
                let answer = format!("RTSP/1.0 200 OK\r\nCSeq: {}\r\n\r\n", request.cseq().unwrap());
                socket.send_to(answer.as_bytes(), peer).unwrap();
            }
            received.push(request);
        }
        received
    });

    let config = ClientConfig {
        read_timeout: Duration::from_millis(200),
        ..quiet_config()
    };
    let client = Client::new(&format!("rtspu://{authority}/live"), config).unwrap();
    let response = client.options().unwrap();
    assert_eq!(response.status().map(|s| s.0), Some(200));
    assert_eq!(client.stats().retransmissions, 1);
    client.close();

    let received = server.join().unwrap();
    assert_eq!(received[0].cseq(), Some(1));
    assert_eq!(received[1].cseq(), Some(1));
}

#[test]
fn keep_alive_falls_back_to_options_after_not_implemented() {
    let (sent, keep_alives) = mpsc::channel();
    let mut playing = false;
    let (authority, server) = mock(1, move |_, request, stream| {
        if !playing {
            playing = request.method() == Some(&Method::Play);
            describe_setup_play(request, stream);
            return;
        }
        let _ = sent.send((request.method().cloned(), request.header("Session").map(str::to_string)));
        match request.method() {
            Some(Method::GetParameter) => reply(stream, request, "501 Not Implemented", ""),
            _ => reply(stream, request, "200 OK", ""),
        }
    });
    let config = ClientConfig {
        media_transport: MediaTransport::Interleaved,
        keep_alive: true,
        keep_alive_interval: Some(Duration::from_millis(200)),
        ..quiet_config()
    };
    let client = Client::new(&format!("rtsp://{authority}/live"), config).unwrap();
    client.start_playing(None).unwrap();

    let session = Some("1234".to_string());
    let first = keep_alives.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(first, (Some(Method::GetParameter), session.clone()));
    let second = keep_alives.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(second, (Some(Method::Options), session));
    assert!(client.is_playing());
    assert!(!client.supported_methods().contains(&Method::GetParameter));

    client.close();
    let received = server.join().unwrap();
    assert_eq!(
        received.last().and_then(|m| m.method().cloned()),
        Some(Method::Teardown)
    );
}
