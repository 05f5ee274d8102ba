use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::debug;

/// 无状态上游客户端：每次查询用一个新 socket，避免请求间串扰。
/// Stateless upstream client, one fresh socket per query.
///
/// Errors are reported to the caller and never retried here; the pool
/// racer decides what a failed upstream means.
#[derive(Debug, Clone, Copy, Default)]
pub struct Exchanger;

impl Exchanger {
    /// Sends `packet` to one upstream and awaits its reply.
    ///
    /// The reply must echo the transaction id; anything else on this
    /// freshly bound socket is a stray datagram and is skipped. Dropping
    /// the returned future closes the socket, so callers can abandon the
    /// wait without leaking descriptors.
    pub async fn exchange(
        &self,
        packet: &[u8],
        upstream: SocketAddr,
        timeout_dur: Duration,
    ) -> Result<Message> {
        let bind_addr = if upstream.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await.context("bind query socket")?;
        socket
            .connect(upstream)
            .await
            .with_context(|| format!("connect upstream {upstream}"))?;
        socket.send(packet).await.context("send query")?;

        let mut buf = [0u8; 4096];
        let reply = timeout(timeout_dur, async {
            loop {
                let len = socket.recv(&mut buf).await.context("recv reply")?;
                if len >= 2 && packet.len() >= 2 && buf[..2] == packet[..2] {
                    return Message::from_bytes(&buf[..len]).context("parse upstream reply");
                }
            }
        })
        .await;

        match reply {
            Ok(result) => result,
            Err(_) => anyhow::bail!("upstream {upstream} timed out"),
        }
    }

    /// 池内竞速：所有上游并发出击，先答先赢 / Race every upstream in the
    /// pool, first successful reply wins.
    ///
    /// Upstream failures do not short-circuit the race; the remaining
    /// siblings keep running until one answers, all have failed, or the
    /// pool deadline fires. Returning drops the `JoinSet`, which aborts
    /// whatever is still in flight.
    pub async fn race_pool(
        &self,
        packet: &[u8],
        pool: &[SocketAddr],
        timeout_dur: Duration,
    ) -> Result<Message> {
        let (tx, mut rx) = mpsc::channel::<Message>(1);
        let mut inflight = JoinSet::new();
        for &upstream in pool {
            let exchanger = *self;
            let packet = packet.to_vec();
            let tx = tx.clone();
            inflight.spawn(async move {
                match exchanger.exchange(&packet, upstream, timeout_dur).await {
                    // A sibling may have won already; dropping the reply is fine.
                    Ok(msg) => {
                        let _ = tx.try_send(msg);
                    }
                    Err(err) => debug!(upstream = %upstream, error = %err, "upstream query failed"),
                }
            });
        }
        drop(tx);

        match timeout(timeout_dur, rx.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => anyhow::bail!("all upstreams in pool failed"),
            Err(_) => anyhow::bail!("pool timed out after {}ms", timeout_dur.as_millis()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn query_packet(name: &str) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(0x4242);
        let mut query = Query::new();
        query.set_name(Name::from_str(name).unwrap());
        query.set_query_type(RecordType::A);
        msg.add_query(query);
        let mut out = Vec::with_capacity(64);
        {
            let mut encoder = BinEncoder::new(&mut out);
            msg.emit(&mut encoder).unwrap();
        }
        out
    }

    /// Fake upstream that answers every query with `addr` after `delay`.
    async fn spawn_upstream(addr: Ipv4Addr, delay: Duration) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                let req = Message::from_bytes(&buf[..len]).unwrap();
                let mut resp = Message::new();
                resp.set_id(req.id());
                resp.set_message_type(MessageType::Response);
                resp.set_op_code(OpCode::Query);
                resp.set_recursion_available(true);
                resp.add_queries(req.queries().to_vec());
                resp.add_answer(Record::from_rdata(
                    req.queries()[0].name().clone(),
                    60,
                    RData::A(A(addr)),
                ));
                let mut out = Vec::with_capacity(512);
                {
                    let mut encoder = BinEncoder::new(&mut out);
                    resp.emit(&mut encoder).unwrap();
                }
                tokio::time::sleep(delay).await;
                let _ = socket.send_to(&out, peer).await;
            }
        });
        local
    }

    fn answer_a(msg: &Message) -> Ipv4Addr {
        match msg.answers()[0].data() {
            Some(RData::A(a)) => a.0,
            other => panic!("unexpected rdata: {other:?}"),
        }
    }

    #[tokio::test]
    async fn exchange_round_trips_a_query() {
        let upstream = spawn_upstream(Ipv4Addr::new(1, 2, 3, 4), Duration::ZERO).await;
        let packet = query_packet("example.cn.");

        let reply = Exchanger
            .exchange(&packet, upstream, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply.id(), 0x4242);
        assert_eq!(answer_a(&reply), Ipv4Addr::new(1, 2, 3, 4));
    }

    #[tokio::test]
    async fn exchange_times_out_on_silent_upstream() {
        let silent = spawn_upstream(Ipv4Addr::new(1, 2, 3, 4), Duration::from_secs(60)).await;
        let packet = query_packet("example.cn.");

        let err = Exchanger
            .exchange(&packet, silent, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn race_pool_first_reply_wins() {
        let slow = spawn_upstream(Ipv4Addr::new(9, 9, 9, 9), Duration::from_millis(300)).await;
        let fast = spawn_upstream(Ipv4Addr::new(1, 2, 3, 4), Duration::from_millis(10)).await;
        let packet = query_packet("example.cn.");

        let reply = Exchanger
            .race_pool(&packet, &[slow, fast], Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(answer_a(&reply), Ipv4Addr::new(1, 2, 3, 4));
    }

    #[tokio::test]
    async fn race_pool_survives_a_failing_sibling() {
        // Port from a socket we immediately drop: nothing listens there.
        let dead = {
            let s = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            s.local_addr().unwrap()
        };
        let live = spawn_upstream(Ipv4Addr::new(1, 2, 3, 4), Duration::from_millis(20)).await;
        let packet = query_packet("example.cn.");

        let reply = Exchanger
            .race_pool(&packet, &[dead, live], Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(answer_a(&reply), Ipv4Addr::new(1, 2, 3, 4));
    }

    #[tokio::test]
    async fn race_pool_reports_timeout_when_pool_is_silent() {
        let silent = spawn_upstream(Ipv4Addr::new(1, 2, 3, 4), Duration::from_secs(60)).await;
        let packet = query_packet("example.cn.");

        let start = std::time::Instant::now();
        let err = Exchanger
            .race_pool(&packet, &[silent], Duration::from_millis(80))
            .await
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(err.to_string().contains("timed out") || err.to_string().contains("failed"));
    }
}
