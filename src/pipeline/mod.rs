//! 记录富化
//!
//! 拓扑匹配 → 归属解析 → 同网/异网判定 → 组装局部更新。
//! 未匹配或缺字段的记录不进入写回批次。

pub mod classify;
pub mod variant;

pub use variant::{Skip, Variant};

use crate::geo::CycleResolver;
use crate::store::{FlowRecord, UpdateOp};
use crate::topology::TopologyMap;

/// 一批记录的富化结果
#[derive(Debug, Default)]
pub struct EnrichReport {
    pub updates: Vec<UpdateOp>,
    /// 拓扑中没有对应条目的记录数
    pub unmatched: usize,
    /// 缺少必需字段的记录数
    pub incomplete: usize,
}

pub fn enrich_records(
    variant: &Variant,
    records: &[FlowRecord],
    topology: &TopologyMap,
    resolver: &mut CycleResolver<'_>,
) -> EnrichReport {
    let mut report = EnrichReport::default();
    if topology.is_empty() {
        report.unmatched = records.len();
        return report;
    }

    for record in records {
        match variant.derive(&record.source, topology, resolver) {
            Ok(mut doc) => {
                doc.retain(|k, _| variant.derived_fields.iter().any(|f| *f == k.as_str()));
                report.updates.push(UpdateOp {
                    partition: record.partition.clone(),
                    id: record.id.clone(),
                    doc,
                });
            }
            Err(Skip::Unmatched) => report.unmatched += 1,
            Err(Skip::Incomplete(field)) => {
                report.incomplete += 1;
                tracing::debug!(id = %record.id, "记录缺少字段 {}，已跳过", field);
            }
        }
    }

    tracing::debug!(
        matched = report.updates.len(),
        unmatched = report.unmatched,
        incomplete = report.incomplete,
        lookups = resolver.lookups(),
        cached = resolver.cached(),
        "富化完成"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::testing::{index_with, v4_record};
    use crate::topology::{TopologyKey, parse_entries};
    use serde_json::{Value, json};

    fn record(id: &str, source: Value) -> FlowRecord {
        FlowRecord {
            id: id.to_string(),
            partition: "sflow-2024.11.17".to_string(),
            timestamp: None,
            source,
        }
    }

    fn flow_source(iface: u32, src: &str, dst: &str) -> Value {
        json!({
            "host": {"ip": "220.202.8.254"},
            "output_interface_value": iface,
            "src_ip": src,
            "dst_ip": dst,
            "bytes": 1500
        })
    }

    fn topology() -> TopologyMap {
        TopologyMap::build(
            TopologyKey::HostAndInterface,
            parse_entries(json!([{
                "host_ip": "220.202.8.254", "interface": 13, "agent_ip": "58.49.1.1",
                "node": "湖北武汉电信", "costumer": "客户A", "switch": "Eth1/1",
                "direction": "out", "flow_direction": "出站"
            }]))
            .unwrap(),
        )
    }

    #[test]
    fn test_unmatched_records_are_excluded_from_batch() {
        let telecom = v4_record("中国电信", "湖北", "武汉");
        let (index, _) = index_with(&[("58.49.1.1", telecom.as_str())]);
        let mut resolver = index.begin_cycle();

        let records = vec![
            record("a", flow_source(13, "58.49.1.1", "58.49.1.1")),
            record("b", flow_source(14, "58.49.1.1", "58.49.1.1")),
            record("c", flow_source(13, "58.49.1.1", "8.8.8.8")),
            record("d", json!({"host": {"ip": "220.202.8.254"}, "output_interface_value": 13})),
        ];
        let report = enrich_records(&variant::FLOW, &records, &topology(), &mut resolver);

        let ids: Vec<&str> = report.updates.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(report.unmatched, 1);
        assert_eq!(report.incomplete, 1);

        assert_eq!(report.updates[0].doc["flow_isp_type"], "同网省内");
        assert_eq!(report.updates[1].doc["flow_isp_type"], "异网(未知)");
        // 原始字段不进入更新
        assert!(!report.updates[0].doc.contains_key("bytes"));
        assert!(!report.updates[0].doc.contains_key("src_ip"));
    }

    #[test]
    fn test_repeated_addresses_resolve_once_per_cycle() {
        let telecom = v4_record("中国电信", "湖北", "武汉");
        let (index, fixed) = index_with(&[("58.49.1.1", telecom.as_str())]);
        let mut resolver = index.begin_cycle();

        let records: Vec<_> = (0..10)
            .map(|i| record(&format!("r{}", i), flow_source(13, "58.49.1.1", "1.2.3.4")))
            .collect();
        let report = enrich_records(&variant::FLOW, &records, &topology(), &mut resolver);

        assert_eq!(report.updates.len(), 10);
        // agent/src 同一地址，加上一个 dst
        assert_eq!(*fixed.calls.lock(), 2);
    }

    #[test]
    fn test_empty_topology_enriches_nothing() {
        let (index, fixed) = index_with(&[]);
        let mut resolver = index.begin_cycle();
        let records = vec![record("a", flow_source(13, "1.1.1.1", "2.2.2.2"))];

        let report = enrich_records(
            &variant::FLOW,
            &records,
            &TopologyMap::empty(TopologyKey::HostAndInterface),
            &mut resolver,
        );
        assert!(report.updates.is_empty());
        assert_eq!(report.unmatched, 1);
        assert_eq!(*fixed.calls.lock(), 0);
    }
}
