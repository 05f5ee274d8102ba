use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use bytes::Bytes;
use hickory_proto::op::Message;
use hickory_proto::rr::{RData, RecordType};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at};
use tracing::{debug, info, warn};

use crate::chnroute::ChnRoute;
use crate::config::Config;
use crate::dns64::{self, QueryIntent};
use crate::proto_utils::{parse_quick, rewrite_qtype};
use crate::upstream::Exchanger;

/// 应答来源池 / Which pool produced an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Domestic,
    Overseas,
}

/// One pool's reply, waiting for arbitration.
struct Envelope {
    msg: Message,
    origin: Origin,
}

/// 每请求仲裁核心：双池竞速、分类、宽限窗口、DNS64 合成。
/// Per-request arbitration core shared by the UDP and DoT listeners.
#[derive(Clone)]
pub struct Engine {
    config: Arc<Config>,
    chnroute: Arc<ChnRoute>,
    exchanger: Exchanger,
}

impl Engine {
    pub fn new(config: Arc<Config>, chnroute: Arc<ChnRoute>) -> Self {
        Self {
            config,
            chnroute,
            exchanger: Exchanger,
        }
    }

    /// Handles one wire-format query and returns the wire-format reply.
    ///
    /// Errors mean "write nothing and let the client retry": both pools
    /// failed, the request deadline fired, or the packet was not a query
    /// we can route.
    pub async fn handle_packet(&self, packet: &[u8]) -> Result<Bytes> {
        let mut qname_buf = [0u8; 256];
        let quick = parse_quick(packet, &mut qname_buf).context("unparseable query")?;
        let qname = quick.qname.to_string();
        let qtype = RecordType::from(quick.qtype);
        let intent = match qtype {
            RecordType::A => QueryIntent::A,
            RecordType::AAAA => QueryIntent::Aaaa,
            _ => QueryIntent::Other,
        };
        let timeout_dur = self.config.timeout();
        let start = Instant::now();

        // 非 A/AAAA 不参与分类与合成，只走海外池
        if intent == QueryIntent::Other {
            let reply = self
                .exchanger
                .race_pool(packet, &self.config.overseas, timeout_dur)
                .await?;
            let bytes = encode(&reply)?;
            info!(
                event = "dns_response",
                id = quick.tx_id,
                qname = %qname,
                qtype = ?qtype,
                origin = ?Origin::Overseas,
                latency_ms = start.elapsed().as_millis() as u64,
                "passthrough answer committed"
            );
            return Ok(bytes);
        }

        // AAAA 在上游侧按 A 查询，合成阶段再还原
        let mut wire = packet.to_vec();
        if intent == QueryIntent::Aaaa {
            rewrite_qtype(&mut wire, quick.qtype_offset, u16::from(RecordType::A));
        }

        let deadline = tokio::time::Instant::now() + 2 * timeout_dur;
        let (tx, mut rx) = mpsc::channel::<Envelope>(2);
        let mut racers = JoinSet::new();
        for (pool, origin) in [
            (self.config.domestic.clone(), Origin::Domestic),
            (self.config.overseas.clone(), Origin::Overseas),
        ] {
            let exchanger = self.exchanger;
            let wire = wire.clone();
            let tx = tx.clone();
            let qname = qname.clone();
            racers.spawn(async move {
                match exchanger.race_pool(&wire, &pool, timeout_dur).await {
                    // 仲裁已提交时投递落空，丢弃即可 / Delivery is dropped when
                    // arbitration has already committed.
                    Ok(msg) => {
                        let _ = tx.try_send(Envelope { msg, origin });
                    }
                    Err(err) => {
                        warn!(qname = %qname, origin = ?origin, error = %err, "pool produced no answer")
                    }
                }
            });
        }
        drop(tx);

        let first = match timeout_at(deadline, rx.recv()).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => anyhow::bail!("both pools failed for {qname}"),
            Err(_) => anyhow::bail!("request deadline exceeded for {qname}"),
        };

        let (chosen, origin) = match first.origin {
            Origin::Domestic => {
                if self.accept_now(&first.msg, &qname) {
                    (first.msg, Origin::Domestic)
                } else {
                    // 国内答案指向境外地址：改用海外池的回答，受请求期限约束
                    match timeout_at(deadline, rx.recv()).await {
                        Ok(Some(second)) => (second.msg, second.origin),
                        Ok(None) => anyhow::bail!(
                            "overseas pool failed after out-of-region domestic answer for {qname}"
                        ),
                        Err(_) => anyhow::bail!("request deadline exceeded for {qname}"),
                    }
                }
            }
            Origin::Overseas => {
                // 海外先到：开宽限窗口，给稍慢的国内池一次机会
                match timeout(self.config.grace(), rx.recv()).await {
                    Ok(Some(second)) if self.accept_now(&second.msg, &qname) => {
                        (second.msg, second.origin)
                    }
                    _ => (first.msg, Origin::Overseas),
                }
            }
        };

        // Single commit point: exactly one response leaves this function,
        // and dropping `racers` aborts whatever is still in flight.
        let response = dns64::synthesize(&chosen, intent, &self.chnroute, &self.config.prefix);
        let bytes = encode(&response)?;
        info!(
            event = "dns_response",
            id = quick.tx_id,
            qname = %qname,
            qtype = ?qtype,
            origin = ?origin,
            answers = response.answers().len(),
            latency_ms = start.elapsed().as_millis() as u64,
            "answer committed"
        );
        drop(racers);
        Ok(bytes)
    }

    /// 单条 A 记录查表；空答案或多条 A 一律接受当前信封。
    ///
    /// Empty answers (NXDOMAIN, NODATA, CNAME-only chains) and multi-A
    /// answers are not confidently decidable from one record, so the
    /// envelope is accepted as-is.
    fn accept_now(&self, msg: &Message, qname: &str) -> bool {
        let mut a_addrs = msg.answers().iter().filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(a.0),
            _ => None,
        });
        let Some(first) = a_addrs.next() else {
            return true;
        };
        if a_addrs.next().is_some() {
            return true;
        }
        let in_region = self.chnroute.contains(first);
        debug!(qname = %qname, address = %first, in_region, "classified single-A answer");
        in_region
    }
}

fn encode(msg: &Message) -> Result<Bytes> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder).context("encode response")?;
    }
    Ok(Bytes::from(out))
}
