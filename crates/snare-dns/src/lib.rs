//! Forwarding DNS interceptor.
//!
//! Every inbound query is forwarded byte-identical to the upstream
//! resolver, alternating TCP and UDP transports. Answers whose name matches
//! the configured pattern are rewritten: A records point back at the proxy
//! address with a short TTL, AAAA records are dropped so clients fall back
//! to the rewritten IPv4 answer. Anything that cannot be answered upstream
//! returns NXDomain; malformed traffic never takes the server down.

mod forward;

use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use regex::Regex;
use snare_log::{DnsQuestion, Logger};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

use forward::Forwarder;

/// Upstream resolver queried when none is configured.
pub const DEFAULT_DNS_SERVER: &str = "8.8.8.8";
/// TTL stamped onto rewritten A answers.
pub const REWRITE_TTL: u32 = 60;

const MAX_DATAGRAM: usize = 4096;

/// Forwarding DNS server bound to one address for both UDP and TCP.
pub struct DnsServer {
    pub listen_addr: String,
    pub port: u16,
    pub forward_addr: String,
    pub pattern: String,
    pub logger: Logger,
}

impl DnsServer {
    pub fn new(
        listen_addr: impl Into<String>,
        port: u16,
        forward_addr: impl Into<String>,
        pattern: impl Into<String>,
        logger: Logger,
    ) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            port,
            forward_addr: forward_addr.into(),
            pattern: pattern.into(),
            logger,
        }
    }

    /// Binds the UDP and TCP sockets. Returns the running server so callers
    /// can learn the bound port before serving.
    pub async fn bind(self) -> io::Result<BoundDnsServer> {
        let interceptor = Interceptor::new(&self)?;

        let udp = UdpSocket::bind((self.listen_addr.as_str(), self.port)).await?;
        let port = udp.local_addr()?.port();
        let tcp = TcpListener::bind((self.listen_addr.as_str(), port)).await?;

        self.logger
            .with_field("addr", format!("{}:{port}", self.listen_addr))
            .info("dns server started");

        Ok(BoundDnsServer {
            udp: Arc::new(udp),
            tcp,
            interceptor: Arc::new(interceptor),
            port,
        })
    }

    /// Binds and serves until a socket error.
    pub async fn listen_and_serve(self) -> io::Result<()> {
        self.bind().await?.serve().await
    }
}

pub struct BoundDnsServer {
    udp: Arc<UdpSocket>,
    tcp: TcpListener,
    interceptor: Arc<Interceptor>,
    port: u16,
}

impl BoundDnsServer {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn serve(self) -> io::Result<()> {
        let udp_task = serve_udp(Arc::clone(&self.udp), Arc::clone(&self.interceptor));
        let tcp_task = serve_tcp(self.tcp, Arc::clone(&self.interceptor));
        tokio::try_join!(udp_task, tcp_task)?;
        Ok(())
    }
}

async fn serve_udp(socket: Arc<UdpSocket>, interceptor: Arc<Interceptor>) -> io::Result<()> {
    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = socket.recv_from(&mut buf).await?;
        let raw = buf[..len].to_vec();
        let socket = Arc::clone(&socket);
        let interceptor = Arc::clone(&interceptor);
        tokio::spawn(async move {
            if let Some(response) = interceptor.handle(&raw).await {
                let _ = socket.send_to(&response, peer).await;
            }
        });
    }
}

async fn serve_tcp(listener: TcpListener, interceptor: Arc<Interceptor>) -> io::Result<()> {
    loop {
        let (mut stream, _) = listener.accept().await?;
        let interceptor = Arc::clone(&interceptor);
        tokio::spawn(async move {
            loop {
                let mut len_bytes = [0u8; 2];
                if stream.read_exact(&mut len_bytes).await.is_err() {
                    return;
                }
                let len = u16::from_be_bytes(len_bytes) as usize;
                let mut raw = vec![0u8; len];
                if stream.read_exact(&mut raw).await.is_err() {
                    return;
                }

                let Some(response) = interceptor.handle(&raw).await else {
                    return;
                };
                let frame = (response.len() as u16).to_be_bytes();
                if stream.write_all(&frame).await.is_err()
                    || stream.write_all(&response).await.is_err()
                {
                    return;
                }
            }
        });
    }
}

#[derive(Debug)]
struct Interceptor {
    rewrite_to: Option<Ipv4Addr>,
    pattern: Option<Regex>,
    forwarder: Forwarder,
    logger: Logger,
}

impl Interceptor {
    fn new(server: &DnsServer) -> io::Result<Self> {
        // An empty pattern matches nothing rather than everything.
        let pattern = if server.pattern.is_empty() {
            None
        } else {
            Some(Regex::new(&server.pattern).map_err(|error| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid dns_regex {:?}: {error}", server.pattern),
                )
            })?)
        };

        let rewrite_to = server.listen_addr.parse::<Ipv4Addr>().ok();
        if rewrite_to.is_none() && pattern.is_some() {
            server
                .logger
                .with_field("listen_addr", server.listen_addr.clone())
                .warning("listen address is not an IPv4 literal, matching answers pass unchanged");
        }

        let upstream = if server.forward_addr.is_empty() {
            DEFAULT_DNS_SERVER.to_string()
        } else {
            server.forward_addr.clone()
        };

        Ok(Self {
            rewrite_to,
            pattern,
            forwarder: Forwarder::new(upstream),
            logger: server.logger.clone(),
        })
    }

    /// Full handling of one wire-format query. Returns the wire-format
    /// response, or nothing when the query is not even parseable.
    async fn handle(&self, raw: &[u8]) -> Option<Vec<u8>> {
        let query = Message::from_vec(raw).ok()?;

        let response = match self.forwarder.forward(raw).await {
            Ok(bytes) => match Message::from_vec(&bytes) {
                Ok(upstream) => self.rewrite(&query, &upstream),
                Err(error) => {
                    self.logger
                        .with_error(&error)
                        .error("dns upstream returned an unparseable response");
                    self.nxdomain(&query)
                }
            },
            Err(error) => {
                self.logger
                    .with_error(&error)
                    .error("dns client forwarding failed");
                self.nxdomain(&query)
            }
        };

        response.to_vec().ok()
    }

    /// Rebuilds the upstream answer section, rewriting A records for names
    /// that match the pattern and dropping matching AAAA records.
    fn rewrite(&self, query: &Message, upstream: &Message) -> Message {
        let mut response = self.response_skeleton(query);
        let mut found = false;

        for answer in upstream.answers() {
            let name = answer.name().to_string();
            let matched = self
                .pattern
                .as_ref()
                .map(|pattern| pattern.is_match(&name))
                .unwrap_or(false);

            if matched && answer.record_type() == RecordType::A {
                let Some(rewrite_to) = self.rewrite_to else {
                    response.add_answer(answer.clone());
                    found = true;
                    continue;
                };
                let record =
                    Record::from_rdata(answer.name().clone(), REWRITE_TTL, RData::A(A(rewrite_to)));
                self.logger
                    .message()
                    .with_dns_answer(&name, REWRITE_TTL, &rewrite_to.to_string())
                    .with_field("req_type", answer.record_type().to_string())
                    .info("[DNS]");
                response.add_answer(record);
                found = true;
            } else if matched && answer.record_type() == RecordType::AAAA {
                self.logger
                    .with_field("req_name", name)
                    .with_field("req_type", answer.record_type().to_string())
                    .info("[DNS] ignoring IPv6 AAAA");
            } else {
                self.logger
                    .message()
                    .with_dns_answer(&name, answer.ttl(), &answer.data().to_string())
                    .with_field("req_type", answer.record_type().to_string())
                    .info("[DNS]");
                response.add_answer(answer.clone());
                found = true;
            }
        }

        if !found {
            response.set_response_code(ResponseCode::NXDomain);
            self.log_nxdomain(query);
        }
        response
    }

    fn nxdomain(&self, query: &Message) -> Message {
        let mut response = self.response_skeleton(query);
        response.set_response_code(ResponseCode::NXDomain);
        self.log_nxdomain(query);
        response
    }

    fn response_skeleton(&self, query: &Message) -> Message {
        let mut response = Message::new();
        response.set_id(query.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(OpCode::Query);
        response.set_recursion_desired(query.recursion_desired());
        response.set_recursion_available(true);
        for question in query.queries() {
            response.add_query(question.clone());
        }
        response
    }

    fn log_nxdomain(&self, query: &Message) {
        let questions = query.queries().iter().map(|question| {
            DnsQuestion::new(
                question.name().to_string(),
                question.query_type().to_string(),
                question.query_class().to_string(),
            )
        });
        self.logger
            .message()
            .with_dns_questions(questions)
            .with_dns_nxdomain()
            .info("[DNS] NXDomain");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::AAAA;
    use hickory_proto::rr::{DNSClass, Name};
    use std::str::FromStr;

    fn interceptor(pattern: &str, rewrite_to: &str) -> Interceptor {
        let server = DnsServer::new(rewrite_to, 0, "127.0.0.1", pattern, Logger::discard());
        Interceptor::new(&server).expect("interceptor")
    }

    fn query_for(name: &str) -> Message {
        let mut query = Message::new();
        query.set_id(4242);
        query.set_recursion_desired(true);
        query.add_query(Query::query(
            Name::from_str(name).expect("name"),
            RecordType::A,
        ));
        query
    }

    fn a_record(name: &str, ttl: u32, addr: [u8; 4]) -> Record {
        Record::from_rdata(
            Name::from_str(name).expect("name"),
            ttl,
            RData::A(A(addr.into())),
        )
    }

    fn upstream_with(records: Vec<Record>) -> Message {
        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        for record in records {
            message.add_answer(record);
        }
        message
    }

    #[test]
    fn matching_a_answers_point_at_the_proxy_with_short_ttl() {
        let interceptor = interceptor("^match\\.", "10.0.0.1");
        let query = query_for("match.example.");
        let upstream = upstream_with(vec![a_record("match.example.", 300, [1, 2, 3, 4])]);

        let response = interceptor.rewrite(&query, &upstream);
        assert_eq!(response.id(), 4242);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 1);

        let answer = &response.answers()[0];
        assert_eq!(answer.ttl(), REWRITE_TTL);
        assert_eq!(answer.data(), &RData::A(A(Ipv4Addr::new(10, 0, 0, 1))));
    }

    #[test]
    fn non_matching_answers_pass_through_unchanged() {
        let interceptor = interceptor("^match\\.", "10.0.0.1");
        let query = query_for("other.example.");
        let original = a_record("other.example.", 123, [5, 6, 7, 8]);
        let upstream = upstream_with(vec![original.clone()]);

        let response = interceptor.rewrite(&query, &upstream);
        assert_eq!(response.answers(), &[original]);
    }

    #[test]
    fn matching_aaaa_answers_are_dropped_silently() {
        let interceptor = interceptor("^match\\.", "10.0.0.1");
        let query = query_for("match.example.");
        let aaaa = Record::from_rdata(
            Name::from_str("match.example.").expect("name"),
            300,
            RData::AAAA(AAAA(std::net::Ipv6Addr::LOCALHOST)),
        );
        let a = a_record("match.example.", 300, [1, 2, 3, 4]);
        let upstream = upstream_with(vec![aaaa, a]);

        let response = interceptor.rewrite(&query, &upstream);
        // The AAAA vanishes but the surviving A keeps the answer from
        // degrading to NXDomain.
        assert_eq!(response.answers().len(), 1);
        assert_eq!(response.answers()[0].record_type(), RecordType::A);
        assert_eq!(response.response_code(), ResponseCode::NoError);
    }

    #[test]
    fn only_matching_aaaa_yields_nxdomain() {
        let interceptor = interceptor("^match\\.", "10.0.0.1");
        let query = query_for("match.example.");
        let aaaa = Record::from_rdata(
            Name::from_str("match.example.").expect("name"),
            300,
            RData::AAAA(AAAA(std::net::Ipv6Addr::LOCALHOST)),
        );
        let upstream = upstream_with(vec![aaaa]);

        let response = interceptor.rewrite(&query, &upstream);
        assert!(response.answers().is_empty());
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
    }

    #[test]
    fn empty_pattern_matches_nothing() {
        let interceptor = interceptor("", "10.0.0.1");
        let query = query_for("match.example.");
        let original = a_record("match.example.", 300, [1, 2, 3, 4]);
        let upstream = upstream_with(vec![original.clone()]);

        let response = interceptor.rewrite(&query, &upstream);
        assert_eq!(response.answers(), &[original]);
    }

    #[test]
    fn empty_upstream_answers_yield_nxdomain() {
        let interceptor = interceptor("^match\\.", "10.0.0.1");
        let query = query_for("gone.example.");
        let response = interceptor.rewrite(&query, &upstream_with(Vec::new()));
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
    }

    #[test]
    fn bad_patterns_fail_construction() {
        let server = DnsServer::new("127.0.0.1", 0, "", "([", Logger::discard());
        let error = Interceptor::new(&server).expect_err("invalid regex");
        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn queries_echo_into_the_response_skeleton() {
        let interceptor = interceptor("", "127.0.0.1");
        let mut question = Query::query(
            Name::from_str("echo.example.").expect("name"),
            RecordType::A,
        );
        question.set_query_class(DNSClass::IN);
        let mut query = Message::new();
        query.set_id(9);
        query.add_query(question);

        let response = interceptor.nxdomain(&query);
        assert_eq!(response.queries().len(), 1);
        assert_eq!(response.queries()[0].name().to_string(), "echo.example.");
        assert_eq!(response.message_type(), MessageType::Response);
    }
}
