use std::net::Ipv6Addr;

use hickory_proto::op::Message;
use hickory_proto::rr::rdata::AAAA;
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use tracing::debug;

use crate::chnroute::ChnRoute;

/// 客户端原始查询意图。AAAA 查询在上游侧被改写为 A，这里记住原意。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIntent {
    A,
    Aaaa,
    Other,
}

/// Builds the client-facing response from the arbitrated upstream reply.
///
/// For an original A query the answer section keeps in-region A records
/// and CNAMEs only. For an original AAAA query every A record is mapped
/// into `prefix` (no CIDR filtering here: whatever the arbiter picked is
/// the source of truth, routing past the prefix is the NAT64 gateway's
/// job) and the question is restored to AAAA. Header, rcode, authority
/// and additional sections ride along unchanged.
pub fn synthesize(reply: &Message, intent: QueryIntent, chnroute: &ChnRoute, prefix: &str) -> Message {
    let mut out = reply.clone();
    match intent {
        QueryIntent::A => {
            let answers = out.take_answers();
            let kept = answers
                .into_iter()
                .filter(|record| match record.data() {
                    Some(RData::A(a)) => chnroute.contains(a.0),
                    Some(RData::CNAME(_)) => true,
                    _ => false,
                })
                .collect();
            out.insert_answers(kept);
        }
        QueryIntent::Aaaa => {
            // 还原客户端问的 AAAA
            let mut queries = out.take_queries();
            for query in &mut queries {
                query.set_query_type(RecordType::AAAA);
            }
            out.add_queries(queries);

            let answers = out.take_answers();
            let mut kept = Vec::with_capacity(answers.len());
            for record in &answers {
                match record.data() {
                    Some(RData::A(a)) => {
                        let mapped = format!("{}{}", prefix, a.0);
                        match mapped.parse::<Ipv6Addr>() {
                            Ok(v6) => {
                                let mut synthesized = Record::from_rdata(
                                    record.name().clone(),
                                    record.ttl(),
                                    RData::AAAA(AAAA(v6)),
                                );
                                synthesized.set_dns_class(DNSClass::IN);
                                kept.push(synthesized);
                            }
                            // Unreachable after startup prefix validation.
                            Err(err) => {
                                debug!(address = %mapped, error = %err, "dns64 mapping failed, dropping record")
                            }
                        }
                    }
                    Some(RData::CNAME(_)) => kept.push(record.clone()),
                    _ => {}
                }
            }
            out.insert_answers(kept);
        }
        QueryIntent::Other => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::rdata::{A, CNAME, TXT};
    use hickory_proto::rr::Name;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    const PREFIX: &str = "2001:db8:aaaa:bbbb:cccc:dddd:";

    fn chnroute() -> ChnRoute {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        writeln!(f, "1.2.0.0/16").unwrap();
        f.flush().unwrap();
        ChnRoute::load(f.path()).unwrap()
    }

    fn reply_with(qtype: RecordType, answers: Vec<Record>) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x7777);
        msg.set_message_type(MessageType::Response);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_available(true);
        msg.set_response_code(ResponseCode::NoError);
        let mut query = Query::new();
        query.set_name(Name::from_str("example.cn.").unwrap());
        query.set_query_type(qtype);
        msg.add_query(query);
        msg.add_answers(answers);
        msg
    }

    fn a_record(name: &str, ttl: u32, addr: [u8; 4]) -> Record {
        Record::from_rdata(
            Name::from_str(name).unwrap(),
            ttl,
            RData::A(A(Ipv4Addr::from(addr))),
        )
    }

    fn cname_record(name: &str, target: &str) -> Record {
        Record::from_rdata(
            Name::from_str(name).unwrap(),
            60,
            RData::CNAME(CNAME(Name::from_str(target).unwrap())),
        )
    }

    #[test]
    fn a_intent_keeps_only_in_region_a_and_cnames() {
        let reply = reply_with(
            RecordType::A,
            vec![
                cname_record("example.cn.", "edge.example.cn."),
                a_record("edge.example.cn.", 60, [1, 2, 3, 4]),
                a_record("edge.example.cn.", 60, [8, 8, 8, 8]),
            ],
        );
        let out = synthesize(&reply, QueryIntent::A, &chnroute(), PREFIX);

        let answers = out.answers();
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0].record_type(), RecordType::CNAME);
        match answers[1].data() {
            Some(RData::A(a)) => assert_eq!(a.0, Ipv4Addr::new(1, 2, 3, 4)),
            other => panic!("unexpected rdata: {other:?}"),
        }
        assert_eq!(out.id(), 0x7777);
    }

    #[test]
    fn aaaa_intent_synthesizes_prefixed_address() {
        // prefix + 1.2.3.4, reparsed as IPv6
        let reply = reply_with(RecordType::A, vec![a_record("example.cn.", 600, [1, 2, 3, 4])]);
        let out = synthesize(&reply, QueryIntent::Aaaa, &chnroute(), PREFIX);

        assert_eq!(out.queries()[0].query_type(), RecordType::AAAA);
        let answers = out.answers();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].ttl(), 600);
        assert_eq!(answers[0].record_type(), RecordType::AAAA);
        match answers[0].data() {
            Some(RData::AAAA(aaaa)) => assert_eq!(
                aaaa.0,
                "2001:db8:aaaa:bbbb:cccc:dddd:1.2.3.4".parse::<Ipv6Addr>().unwrap()
            ),
            other => panic!("unexpected rdata: {other:?}"),
        }
    }

    #[test]
    fn aaaa_intent_does_not_filter_by_region() {
        // 8.8.8.8 is outside the route table but still gets mapped.
        let reply = reply_with(RecordType::A, vec![a_record("example.com.", 60, [8, 8, 8, 8])]);
        let out = synthesize(&reply, QueryIntent::Aaaa, &chnroute(), PREFIX);

        assert_eq!(out.answers().len(), 1);
        match out.answers()[0].data() {
            Some(RData::AAAA(aaaa)) => assert_eq!(
                aaaa.0,
                "2001:db8:aaaa:bbbb:cccc:dddd:8.8.8.8".parse::<Ipv6Addr>().unwrap()
            ),
            other => panic!("unexpected rdata: {other:?}"),
        }
    }

    #[test]
    fn aaaa_intent_keeps_cnames_and_drops_other_types() {
        let txt = Record::from_rdata(
            Name::from_str("example.cn.").unwrap(),
            60,
            RData::TXT(TXT::new(vec!["ignored".to_string()])),
        );
        let reply = reply_with(
            RecordType::A,
            vec![
                cname_record("example.cn.", "edge.example.cn."),
                txt,
                a_record("edge.example.cn.", 60, [1, 2, 3, 4]),
            ],
        );
        let out = synthesize(&reply, QueryIntent::Aaaa, &chnroute(), PREFIX);

        let answers = out.answers();
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0].record_type(), RecordType::CNAME);
        assert_eq!(answers[1].record_type(), RecordType::AAAA);
    }

    #[test]
    fn other_intent_passes_reply_through() {
        let reply = reply_with(RecordType::A, vec![a_record("example.cn.", 60, [8, 8, 8, 8])]);
        let out = synthesize(&reply, QueryIntent::Other, &chnroute(), PREFIX);
        assert_eq!(out.answers().len(), 1);
        assert_eq!(out.answers()[0].record_type(), RecordType::A);
    }

    #[test]
    fn empty_answer_sections_stay_empty() {
        let reply = reply_with(RecordType::A, Vec::new());
        assert!(synthesize(&reply, QueryIntent::A, &chnroute(), PREFIX).answers().is_empty());
        assert!(synthesize(&reply, QueryIntent::Aaaa, &chnroute(), PREFIX).answers().is_empty());
    }
}
