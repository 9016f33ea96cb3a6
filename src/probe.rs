//! Bounded SOCKS5 capability probe.
//!
//! One run is a strict sequence over a single TCP connection:
//! tcp connect -> greeting (+ user/pass) -> CONNECT -> optional UDP ASSOCIATE.
//! Every step records its latency and, on failure, a warning into the summary
//! before the run stops. The summary is returned on every path.

use crate::protocol::{
    self, Address, BoundAddress, Command, METHOD_NO_ACCEPTABLE, METHOD_NO_AUTH, METHOD_USER_PASS,
    ProtocolError, Reply, ReplyHeader,
};
use crate::state::{AuthMethod, ProbeSummary};
use bytes::BytesMut;
use chrono::Utc;
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_CONNECT_TARGET: &str = "example.com:80";

/// RFC 1929 username/password.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default)]
pub struct ProbeConfig {
    /// Proxy endpoint, `host:port`.
    pub server: String,
    /// Budget for the whole run. Zero selects [`DEFAULT_TIMEOUT`].
    pub timeout: Duration,
    /// Offered to the proxy in addition to "no auth".
    pub auth: Option<Credentials>,
    /// CONNECT destination. Blank selects [`DEFAULT_CONNECT_TARGET`].
    pub connect_target: String,
    pub udp_test: bool,
}

/// The ordered steps of a probe run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    TcpConnect,
    SocksHandshake,
    Connect,
    UdpAssociate,
}

impl Step {
    /// Key under which the step's latency is stored.
    pub fn latency_key(&self) -> &'static str {
        match self {
            Step::TcpConnect => "tcp_connect",
            Step::SocksHandshake => "socks_handshake",
            Step::Connect => "connect",
            Step::UdpAssociate => "udp_associate",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::TcpConnect => "tcp connect",
            Step::SocksHandshake => "socks handshake",
            Step::Connect => "connect",
            Step::UdpAssociate => "udp associate",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any network I/O.
    Input,
    /// Dial, read or write failure, deadline or cancellation.
    Transport,
    /// The proxy answered, but not with something we accept.
    Protocol,
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("invalid socks server: {0}")]
    InvalidServer(#[source] ProtocolError),
    #[error("invalid connect target: {0}")]
    InvalidTarget(#[source] ProtocolError),
    #[error("invalid credentials: {0}")]
    InvalidCredentials(#[source] ProtocolError),
    #[error("{step} failed: {source}")]
    Step {
        step: Step,
        #[source]
        source: StepError,
    },
}

impl ProbeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProbeError::InvalidServer(_)
            | ProbeError::InvalidTarget(_)
            | ProbeError::InvalidCredentials(_) => ErrorKind::Input,
            ProbeError::Step { source, .. } => source.kind(),
        }
    }
}

#[derive(Error, Debug)]
pub enum StepError {
    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{op}: deadline exceeded")]
    Timeout { op: &'static str },
    #[error("{op}: cancelled")]
    Cancelled { op: &'static str },
    #[error("{op}: {source}")]
    Framing {
        op: &'static str,
        #[source]
        source: ProtocolError,
    },
    #[error("proxy rejected offered methods")]
    MethodsRejected,
    #[error("unsupported method selected by proxy: 0x{0:02x}")]
    UnsupportedMethod(u8),
    #[error("proxy requires username/password but none provided")]
    CredentialsRequired,
    #[error("user/pass authentication failed")]
    AuthFailed,
    #[error("{0}")]
    Rejected(Reply),
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Io { .. } | StepError::Timeout { .. } | StepError::Cancelled { .. } => {
                ErrorKind::Transport
            }
            _ => ErrorKind::Protocol,
        }
    }
}

fn framing(op: &'static str) -> impl FnOnce(ProtocolError) -> StepError {
    move |source| StepError::Framing { op, source }
}

/// Runs one probe against `config.server`.
///
/// The summary is always populated with whatever was observed, including on
/// error; `last_checked` is stamped on return. Setting `cancel` to `true`
/// aborts the in-flight I/O with a transport error.
pub async fn probe_socks(
    config: &ProbeConfig,
    cancel: Option<watch::Receiver<bool>>,
) -> (ProbeSummary, Result<(), ProbeError>) {
    let mut summary = ProbeSummary::default();
    let result = run(config, cancel, &mut summary).await;
    summary.last_checked = Some(Utc::now());

    match &result {
        Ok(()) => debug!(
            server = %config.server,
            connect_ok = summary.connect_ok,
            udp_ok = summary.udp_ok,
            "socks probe finished"
        ),
        Err(e) => warn!(server = %config.server, error = %e, "socks probe failed"),
    }
    (summary, result)
}

/// Inputs after validation and defaulting.
struct Plan {
    server: Address,
    target: Address,
    timeout: Duration,
    auth: Option<Credentials>,
}

impl Plan {
    fn new(config: &ProbeConfig) -> Result<Self, ProbeError> {
        let server = config
            .server
            .parse::<Address>()
            .map_err(ProbeError::InvalidServer)?;

        let target = if config.connect_target.trim().is_empty() {
            DEFAULT_CONNECT_TARGET
        } else {
            config.connect_target.as_str()
        };
        let target = target
            .parse::<Address>()
            .map_err(ProbeError::InvalidTarget)?;

        if let Some(creds) = &config.auth {
            protocol::check_credentials(&creds.username, &creds.password)
                .map_err(ProbeError::InvalidCredentials)?;
        }

        let timeout = if config.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            config.timeout
        };

        Ok(Self {
            server,
            target,
            timeout,
            auth: config.auth.clone(),
        })
    }
}

async fn run(
    config: &ProbeConfig,
    cancel: Option<watch::Receiver<bool>>,
    summary: &mut ProbeSummary,
) -> Result<(), ProbeError> {
    let plan = Plan::new(config)?;
    let mut guard = Guard {
        deadline: Instant::now() + plan.timeout,
        cancel,
    };

    let stream = timed(summary, Step::TcpConnect, guard.run("dial", dial(&plan.server))).await?;
    summary.reachable = true;
    let mut session = Session { stream, guard };

    let auth = timed(
        summary,
        Step::SocksHandshake,
        session.handshake(plan.auth.as_ref()),
    )
    .await?;
    summary.socks_ok = true;
    summary.features.auth = Some(auth);

    timed(
        summary,
        Step::Connect,
        session.request(Command::Connect, &plan.target),
    )
    .await?;
    summary.connect_ok = true;
    summary.features.ipv6 = plan.target.is_ipv6();

    if config.udp_test {
        // Best effort: a failure here is only a warning.
        let udp = timed(
            summary,
            Step::UdpAssociate,
            session.request(Command::UdpAssociate, &Address::unspecified()),
        )
        .await;
        summary.udp_ok = udp.is_ok();
    }

    Ok(())
}

/// Awaits one step, recording its latency and, on failure, a warning.
async fn timed<T>(
    summary: &mut ProbeSummary,
    step: Step,
    fut: impl Future<Output = Result<T, StepError>>,
) -> Result<T, ProbeError> {
    let started = Instant::now();
    let res = fut.await;
    let elapsed = started.elapsed().as_millis() as u64;
    summary
        .latencies_ms
        .insert(step.latency_key().to_string(), elapsed);

    match res {
        Ok(v) => {
            debug!(%step, elapsed_ms = elapsed, "probe step ok");
            Ok(v)
        }
        Err(source) => {
            let err = ProbeError::Step { step, source };
            summary.warnings.push(err.to_string());
            Err(err)
        }
    }
}

async fn dial(addr: &Address) -> io::Result<TcpStream> {
    match addr {
        Address::Socket(sa) => TcpStream::connect(*sa).await,
        Address::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
    }
}

/// Bounds every I/O by the run deadline and the cancellation signal.
struct Guard {
    deadline: Instant,
    cancel: Option<watch::Receiver<bool>>,
}

impl Guard {
    async fn run<T>(
        &mut self,
        op: &'static str,
        fut: impl Future<Output = io::Result<T>>,
    ) -> Result<T, StepError> {
        tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => Err(StepError::Cancelled { op }),
            res = tokio::time::timeout_at(self.deadline, fut) => match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(source)) => Err(StepError::Io { op, source }),
                Err(_) => Err(StepError::Timeout { op }),
            },
        }
    }
}

async fn cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = cancel {
        let fired = rx.wait_for(|&v| v).await.is_ok();
        if fired {
            return;
        }
    }
    // No signal, or its sender is gone: never fires.
    std::future::pending::<()>().await
}

struct Session {
    stream: TcpStream,
    guard: Guard,
}

impl Session {
    async fn write(&mut self, op: &'static str, buf: &[u8]) -> Result<(), StepError> {
        self.guard.run(op, self.stream.write_all(buf)).await
    }

    async fn read_exact(&mut self, op: &'static str, buf: &mut [u8]) -> Result<(), StepError> {
        self.guard
            .run(op, self.stream.read_exact(buf))
            .await
            .map(|_| ())
    }

    async fn handshake(&mut self, auth: Option<&Credentials>) -> Result<AuthMethod, StepError> {
        let mut buf = BytesMut::with_capacity(4);
        protocol::encode_greeting(auth.is_some(), &mut buf);
        self.write("write greeting", &buf).await?;

        let mut selection = [0u8; 2];
        self.read_exact("read method selection", &mut selection)
            .await?;
        let method = protocol::decode_method_selection(&mut &selection[..])
            .map_err(framing("method selection"))?;

        match method {
            METHOD_NO_AUTH => Ok(AuthMethod::None),
            METHOD_USER_PASS => {
                let creds = auth.ok_or(StepError::CredentialsRequired)?;
                self.user_pass(creds).await?;
                Ok(AuthMethod::UserPass)
            }
            METHOD_NO_ACCEPTABLE => Err(StepError::MethodsRejected),
            other => Err(StepError::UnsupportedMethod(other)),
        }
    }

    async fn user_pass(&mut self, creds: &Credentials) -> Result<(), StepError> {
        let mut buf = BytesMut::with_capacity(3 + creds.username.len() + creds.password.len());
        protocol::encode_user_pass(&creds.username, &creds.password, &mut buf)
            .map_err(framing("encode user/pass"))?;
        self.write("write user/pass", &buf).await?;

        let mut reply = [0u8; 2];
        self.read_exact("read user/pass reply", &mut reply).await?;
        let accepted = protocol::decode_user_pass_reply(&mut &reply[..])
            .map_err(framing("user/pass reply"))?;
        if !accepted {
            return Err(StepError::AuthFailed);
        }
        Ok(())
    }

    /// Sends a CONNECT or UDP ASSOCIATE and consumes the full reply, leaving
    /// the stream positioned at the next message.
    async fn request(&mut self, command: Command, address: &Address) -> Result<(), StepError> {
        let mut buf = BytesMut::with_capacity(3 + address.serialized_len());
        protocol::encode_request(command, address, &mut buf);
        self.write("write request", &buf).await?;

        let mut header = [0u8; ReplyHeader::SIZE];
        self.read_exact("read reply header", &mut header).await?;
        let header = ReplyHeader::decode(&mut &header[..]).map_err(framing("reply header"))?;
        if header.reply != Reply::Succeeded {
            return Err(StepError::Rejected(header.reply));
        }
        self.discard_bound_address(header.atyp).await
    }

    async fn discard_bound_address(&mut self, atyp: u8) -> Result<(), StepError> {
        const OP: &str = "read bound address";
        let len = match BoundAddress::for_atyp(atyp).map_err(framing(OP))? {
            BoundAddress::Fixed(len) => len,
            BoundAddress::LengthPrefixed => {
                let mut prefix = [0u8; 1];
                self.read_exact(OP, &mut prefix).await?;
                protocol::domain_bound_len(prefix[0]).map_err(framing(OP))?
            }
        };
        let mut rest = vec![0u8; len];
        self.read_exact(OP, &mut rest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    const IPV4_BOUND: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90];

    /// Serves one connection with `script` and hands back its result.
    async fn scripted<T, F, Fut>(script: F) -> (SocketAddr, JoinHandle<T>)
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            script(stream).await
        });
        (addr, handle)
    }

    fn config(addr: SocketAddr) -> ProbeConfig {
        ProbeConfig {
            server: addr.to_string(),
            timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    async fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_no_auth_connect_success() {
        let (addr, server) = scripted(|mut s| async move {
            let greeting = read_n(&mut s, 3).await;
            s.write_all(&[0x05, 0x00]).await.unwrap();
            // Default target example.com:80 -> 4 + 1 + 11 + 2 bytes.
            let request = read_n(&mut s, 18).await;
            s.write_all(&IPV4_BOUND).await.unwrap();
            (greeting, request)
        })
        .await;

        let (summary, res) = probe_socks(&config(addr), None).await;
        res.unwrap();

        let (greeting, request) = server.await.unwrap();
        assert_eq!(greeting, vec![0x05, 0x01, 0x00]);
        assert_eq!(&request[..5], &[0x05, 0x01, 0x00, 0x03, 11]);
        assert_eq!(&request[5..16], b"example.com");
        assert_eq!(&request[16..], &[0x00, 0x50]);

        assert!(summary.reachable && summary.socks_ok && summary.connect_ok);
        assert!(!summary.udp_ok);
        assert_eq!(summary.features.auth, Some(AuthMethod::None));
        assert!(!summary.features.ipv6);
        assert!(summary.warnings.is_empty());
        for key in ["tcp_connect", "socks_handshake", "connect"] {
            assert!(summary.latencies_ms.contains_key(key), "missing {key}");
        }
        assert!(!summary.latencies_ms.contains_key("udp_associate"));
        assert!(summary.last_checked.is_some());
    }

    #[tokio::test]
    async fn test_no_acceptable_methods() {
        let (addr, _server) = scripted(|mut s| async move {
            read_n(&mut s, 3).await;
            s.write_all(&[0x05, 0xff]).await.unwrap();
        })
        .await;

        let (summary, res) = probe_socks(&config(addr), None).await;
        let err = res.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(
            err.to_string(),
            "socks handshake failed: proxy rejected offered methods"
        );
        assert!(summary.reachable);
        assert!(!summary.socks_ok);
        assert!(summary.latencies_ms.contains_key("tcp_connect"));
        assert!(summary.latencies_ms.contains_key("socks_handshake"));
        assert!(!summary.latencies_ms.contains_key("connect"));
        assert_eq!(summary.features.auth, None);
        assert_eq!(summary.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_user_pass_and_ipv6_target() {
        let (addr, server) = scripted(|mut s| async move {
            let greeting = read_n(&mut s, 4).await;
            s.write_all(&[0x05, 0x02]).await.unwrap();
            let auth = read_n(&mut s, 1 + 1 + 3 + 1 + 6).await;
            s.write_all(&[0x01, 0x00]).await.unwrap();
            let request = read_n(&mut s, 4 + 16 + 2).await;
            s.write_all(&[0x05, 0x00, 0x00, 0x03, 4, b'h', b'o', b's', b't', 0x00, 0x50])
                .await
                .unwrap();
            (greeting, auth, request)
        })
        .await;

        let mut cfg = config(addr);
        cfg.connect_target = "[2001:db8::1]:443".into();
        cfg.auth = Some(Credentials {
            username: "bob".into(),
            password: "secret".into(),
        });
        let (summary, res) = probe_socks(&cfg, None).await;
        res.unwrap();

        let (greeting, auth, request) = server.await.unwrap();
        assert_eq!(greeting, vec![0x05, 0x02, 0x00, 0x02]);
        assert_eq!(auth, b"\x01\x03bob\x06secret".to_vec());
        assert_eq!(request[3], 0x04);
        assert_eq!(&request[20..], &[0x01, 0xbb]);

        assert_eq!(summary.features.auth, Some(AuthMethod::UserPass));
        assert!(summary.features.ipv6);
        assert!(summary.connect_ok);
    }

    #[tokio::test]
    async fn test_no_auth_selected_even_with_credentials() {
        let (addr, _server) = scripted(|mut s| async move {
            read_n(&mut s, 4).await;
            s.write_all(&[0x05, 0x00]).await.unwrap();
            read_n(&mut s, 18).await;
            s.write_all(&IPV4_BOUND).await.unwrap();
        })
        .await;

        let mut cfg = config(addr);
        cfg.auth = Some(Credentials {
            username: "bob".into(),
            password: "secret".into(),
        });
        let (summary, res) = probe_socks(&cfg, None).await;
        res.unwrap();
        assert_eq!(summary.features.auth, Some(AuthMethod::None));
    }

    #[tokio::test]
    async fn test_user_pass_rejected() {
        let (addr, _server) = scripted(|mut s| async move {
            read_n(&mut s, 4).await;
            s.write_all(&[0x05, 0x02]).await.unwrap();
            read_n(&mut s, 8).await;
            s.write_all(&[0x01, 0x01]).await.unwrap();
        })
        .await;

        let mut cfg = config(addr);
        cfg.auth = Some(Credentials {
            username: "bob".into(),
            password: "pw".into(),
        });
        let (summary, res) = probe_socks(&cfg, None).await;
        let err = res.unwrap_err();
        assert!(matches!(
            err,
            ProbeError::Step {
                step: Step::SocksHandshake,
                source: StepError::AuthFailed
            }
        ));
        assert!(!summary.socks_ok);
    }

    #[tokio::test]
    async fn test_user_pass_required_without_credentials() {
        let (addr, _server) = scripted(|mut s| async move {
            read_n(&mut s, 3).await;
            s.write_all(&[0x05, 0x02]).await.unwrap();
        })
        .await;

        let (summary, res) = probe_socks(&config(addr), None).await;
        assert!(matches!(
            res,
            Err(ProbeError::Step {
                source: StepError::CredentialsRequired,
                ..
            })
        ));
        assert!(summary.reachable && !summary.socks_ok);
    }

    #[tokio::test]
    async fn test_unexpected_method_and_version() {
        let (addr, _server) = scripted(|mut s| async move {
            read_n(&mut s, 3).await;
            s.write_all(&[0x05, 0x01]).await.unwrap();
        })
        .await;
        let (_, res) = probe_socks(&config(addr), None).await;
        assert!(matches!(
            res,
            Err(ProbeError::Step {
                source: StepError::UnsupportedMethod(0x01),
                ..
            })
        ));

        let (addr, _server) = scripted(|mut s| async move {
            read_n(&mut s, 3).await;
            s.write_all(&[0x04, 0x00]).await.unwrap();
        })
        .await;
        let (_, res) = probe_socks(&config(addr), None).await;
        let err = res.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("unexpected version 0x04"));
    }

    #[tokio::test]
    async fn test_connect_rejected() {
        let (addr, _server) = scripted(|mut s| async move {
            read_n(&mut s, 3).await;
            s.write_all(&[0x05, 0x00]).await.unwrap();
            read_n(&mut s, 18).await;
            s.write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        })
        .await;

        let (summary, res) = probe_socks(&config(addr), None).await;
        let err = res.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(
            err.to_string(),
            "connect failed: connection refused by destination host"
        );
        assert!(summary.socks_ok);
        assert!(!summary.connect_ok);
        assert!(summary.latencies_ms.contains_key("connect"));
        assert_eq!(summary.warnings, vec![err.to_string()]);
    }

    #[tokio::test]
    async fn test_zero_length_bound_domain() {
        let (addr, _server) = scripted(|mut s| async move {
            read_n(&mut s, 3).await;
            s.write_all(&[0x05, 0x00]).await.unwrap();
            read_n(&mut s, 18).await;
            s.write_all(&[0x05, 0x00, 0x00, 0x03, 0x00]).await.unwrap();
        })
        .await;

        let (summary, res) = probe_socks(&config(addr), None).await;
        let err = res.unwrap_err();
        assert!(err.to_string().contains("invalid domain length in reply"));
        assert!(!summary.connect_ok);
    }

    #[tokio::test]
    async fn test_udp_associate_failure_is_warning() {
        let (addr, server) = scripted(|mut s| async move {
            read_n(&mut s, 3).await;
            s.write_all(&[0x05, 0x00]).await.unwrap();
            read_n(&mut s, 18).await;
            s.write_all(&IPV4_BOUND).await.unwrap();
            let udp = read_n(&mut s, 10).await;
            s.write_all(&[0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            udp
        })
        .await;

        let mut cfg = config(addr);
        cfg.udp_test = true;
        let (summary, res) = probe_socks(&cfg, None).await;
        assert!(res.is_ok());

        let udp = server.await.unwrap();
        assert_eq!(udp, vec![0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        assert!(summary.connect_ok);
        assert!(!summary.udp_ok);
        assert!(summary.latencies_ms.contains_key("udp_associate"));
        assert_eq!(
            summary.warnings,
            vec!["udp associate failed: command not supported".to_string()]
        );
    }

    #[tokio::test]
    async fn test_udp_associate_success_keeps_feature_flag_reserved() {
        let (addr, _server) = scripted(|mut s| async move {
            read_n(&mut s, 3).await;
            s.write_all(&[0x05, 0x00]).await.unwrap();
            read_n(&mut s, 18).await;
            // Bound address arrives in two segments.
            s.write_all(&IPV4_BOUND[..6]).await.unwrap();
            s.write_all(&IPV4_BOUND[6..]).await.unwrap();
            read_n(&mut s, 10).await;
            s.write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x13, 0x88])
                .await
                .unwrap();
        })
        .await;

        let mut cfg = config(addr);
        cfg.udp_test = true;
        let (summary, res) = probe_socks(&cfg, None).await;
        res.unwrap();
        assert!(summary.udp_ok);
        assert!(!summary.features.udp);
        assert!(summary.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_inputs_fail_before_io() {
        let cases = [
            ("localhost", DEFAULT_CONNECT_TARGET),
            ("127.0.0.1:0", DEFAULT_CONNECT_TARGET),
            ("127.0.0.1:1080", "example.com"),
            ("127.0.0.1:1080", "[::1]:99999"),
        ];
        for (server, target) in cases {
            let cfg = ProbeConfig {
                server: server.into(),
                connect_target: target.into(),
                ..Default::default()
            };
            let (summary, res) = probe_socks(&cfg, None).await;
            assert_eq!(res.unwrap_err().kind(), ErrorKind::Input, "{server} {target}");
            assert!(!summary.reachable);
            assert!(summary.latencies_ms.is_empty());
            assert!(summary.last_checked.is_some());
        }

        let cfg = ProbeConfig {
            server: "127.0.0.1:1080".into(),
            auth: Some(Credentials {
                username: "u".repeat(256),
                password: String::new(),
            }),
            ..Default::default()
        };
        let (summary, res) = probe_socks(&cfg, None).await;
        assert!(matches!(res, Err(ProbeError::InvalidCredentials(_))));
        assert!(summary.latencies_ms.is_empty());

        let cfg = ProbeConfig {
            server: "127.0.0.1:1080".into(),
            auth: Some(Credentials {
                username: "bob".into(),
                password: "p".repeat(256),
            }),
            ..Default::default()
        };
        let (summary, res) = probe_socks(&cfg, None).await;
        let err = res.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
        assert!(matches!(err, ProbeError::InvalidCredentials(_)));
        assert!(!summary.reachable);
        assert!(summary.latencies_ms.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_bound_address_is_transport_error() {
        let (addr, _server) = scripted(|mut s| async move {
            read_n(&mut s, 3).await;
            s.write_all(&[0x05, 0x00]).await.unwrap();
            read_n(&mut s, 18).await;
            // IPv6 bound address cut short, then EOF.
            s.write_all(&[0x05, 0x00, 0x00, 0x04, 0x00, 0x00])
                .await
                .unwrap();
        })
        .await;

        let (summary, res) = probe_socks(&config(addr), None).await;
        let err = res.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(matches!(
            err,
            ProbeError::Step {
                step: Step::Connect,
                source: StepError::Io { .. }
            }
        ));
        assert!(summary.socks_ok);
        assert!(!summary.connect_ok);
        assert!(summary.latencies_ms.contains_key("connect"));
        assert_eq!(summary.warnings, vec![err.to_string()]);
    }

    #[tokio::test]
    async fn test_ipv6_bound_address_is_consumed() {
        let (addr, _server) = scripted(|mut s| async move {
            read_n(&mut s, 3).await;
            s.write_all(&[0x05, 0x00]).await.unwrap();
            read_n(&mut s, 18).await;
            let mut reply = vec![0x05, 0x00, 0x00, 0x04];
            reply.extend_from_slice(&[0x20, 0x01, 0x0d, 0xb8]);
            reply.extend_from_slice(&[0u8; 11]);
            reply.push(0x01);
            reply.extend_from_slice(&[0x1f, 0x90]);
            s.write_all(&reply).await.unwrap();
            read_n(&mut s, 10).await;
            s.write_all(&IPV4_BOUND).await.unwrap();
        })
        .await;

        let mut cfg = config(addr);
        cfg.udp_test = true;
        let (summary, res) = probe_socks(&cfg, None).await;
        res.unwrap();
        assert!(summary.connect_ok);
        // A misaligned stream would make the UDP reply header unreadable.
        assert!(summary.udp_ok);
        assert!(summary.warnings.is_empty());
        // The bound address family says nothing about the target.
        assert!(!summary.features.ipv6);
    }

    #[tokio::test]
    async fn test_udp_associate_domain_bound_address() {
        let (addr, server) = scripted(|mut s| async move {
            read_n(&mut s, 3).await;
            s.write_all(&[0x05, 0x00]).await.unwrap();
            read_n(&mut s, 18).await;
            s.write_all(&IPV4_BOUND).await.unwrap();
            read_n(&mut s, 10).await;
            let mut reply = vec![0x05, 0x00, 0x00, 0x03, 9];
            reply.extend_from_slice(b"relay.lan");
            reply.extend_from_slice(&[0x13, 0x88]);
            s.write_all(&reply).await.unwrap();
            // The client closes once the whole reply is consumed.
            let mut rest = Vec::new();
            s.read_to_end(&mut rest).await.unwrap();
            rest
        })
        .await;

        let mut cfg = config(addr);
        cfg.udp_test = true;
        let (summary, res) = probe_socks(&cfg, None).await;
        res.unwrap();
        assert!(summary.udp_ok);
        assert!(summary.latencies_ms.contains_key("udp_associate"));
        assert!(summary.warnings.is_empty());
        assert!(server.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (summary, res) = probe_socks(&config(addr), None).await;
        assert_eq!(res.unwrap_err().kind(), ErrorKind::Transport);
        assert!(!summary.reachable);
        assert!(summary.latencies_ms.contains_key("tcp_connect"));
        assert!(!summary.latencies_ms.contains_key("socks_handshake"));
        assert!(summary.warnings[0].starts_with("tcp connect failed"));
    }

    #[tokio::test]
    async fn test_deadline_bounds_silent_server() {
        let (addr, _server) = scripted(|mut s| async move {
            read_n(&mut s, 3).await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await;

        let mut cfg = config(addr);
        cfg.timeout = Duration::from_millis(200);
        let started = std::time::Instant::now();
        let (summary, res) = probe_socks(&cfg, None).await;
        assert!(started.elapsed() < Duration::from_secs(2));

        let err = res.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("deadline exceeded"));
        assert!(summary.reachable);
        assert!(!summary.socks_ok);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_run() {
        let (addr, _server) = scripted(|mut s| async move {
            read_n(&mut s, 3).await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await;

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });

        let mut cfg = config(addr);
        cfg.timeout = Duration::from_secs(10);
        let started = std::time::Instant::now();
        let (summary, res) = probe_socks(&cfg, Some(rx)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            res,
            Err(ProbeError::Step {
                step: Step::SocksHandshake,
                source: StepError::Cancelled { .. }
            })
        ));
        assert!(summary.latencies_ms.contains_key("socks_handshake"));
    }
}
