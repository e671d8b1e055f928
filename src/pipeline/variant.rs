//! 记录形态描述
//!
//! 不同采集端写入的记录字段不同，但扫描/水位线/重试骨架一致。
//! 每种形态用一个静态 [`Variant`] 描述：读哪些原始字段、写哪些派生字段、
//! 拓扑如何匹配、用哪个判定函数。启动时选定一次。

use serde_json::{Map, Value, json};

use super::classify::{FlowIspType, classify};
use crate::common::{lookup_path, lookup_str, scalar_to_key};
use crate::geo::{CycleResolver, GeoInfo, UNKNOWN, is_ipv4, normalize_isp};
use crate::model::config::Mode;
use crate::topology::{TopologyEntry, TopologyKey, TopologyMap};

/// 一条记录未被富化的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    /// 拓扑中没有对应条目
    Unmatched,
    /// 缺少必需的原始字段
    Incomplete(&'static str),
}

pub type ClassifyFn = fn(&GeoInfo, &GeoInfo) -> FlowIspType;

type DeriveFn =
    fn(&Variant, &Value, &TopologyMap, &mut CycleResolver<'_>) -> Result<Map<String, Value>, Skip>;

pub struct Variant {
    pub name: &'static str,
    /// 分区名前缀，分区为 `{prefix}-YYYY.MM.DD`
    pub partition_prefix: &'static str,
    pub topology_key: TopologyKey,
    pub raw_fields: &'static [&'static str],
    /// 写回的派生字段，其余字段一律不写
    pub derived_fields: &'static [&'static str],
    pub classify: ClassifyFn,
    derive: DeriveFn,
}

impl std::fmt::Debug for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variant")
            .field("name", &self.name)
            .field("partition_prefix", &self.partition_prefix)
            .field("topology_key", &self.topology_key)
            .finish_non_exhaustive()
    }
}

/// sflow 流量记录
pub static FLOW: Variant = Variant {
    name: "flow",
    partition_prefix: "sflow",
    topology_key: TopologyKey::HostAndInterface,
    raw_fields: &[
        "host.ip",
        "input_interface_value",
        "output_interface_value",
        "src_ip",
        "dst_ip",
    ],
    derived_fields: &[
        "flow_isp_type",
        "flow_isp_info",
        "flow_isp_info_src",
        "customer",
        "node",
        "ipType",
        "sw_interface",
        "src_ip_region",
        "dst_ip_region",
        "flow_direction",
    ],
    classify,
    derive: derive_flow,
};

/// ipbw agent 带宽记录
pub static BANDWIDTH: Variant = Variant {
    name: "bandwidth",
    partition_prefix: "ipbandwidth",
    topology_key: TopologyKey::HostOnly,
    raw_fields: &["host.ip", "in_src", "in_dst"],
    derived_fields: &[
        "host_name",
        "node",
        "customer",
        "interface",
        "local_ip_region",
        "remote_ip_region",
        "local_ip_isp",
        "remote_ip_isp",
        "local_ip_region_full",
        "remote_ip_region_full",
        "local_ip_info",
        "remote_ip_info",
        "flow_isp_type",
    ],
    classify,
    derive: derive_bandwidth,
};

impl Variant {
    pub fn for_mode(mode: Mode) -> &'static Variant {
        match mode {
            Mode::Flow => &FLOW,
            Mode::Bandwidth => &BANDWIDTH,
        }
    }

    /// 计算一条记录的派生字段
    pub fn derive(
        &self,
        source: &Value,
        topology: &TopologyMap,
        resolver: &mut CycleResolver<'_>,
    ) -> Result<Map<String, Value>, Skip> {
        (self.derive)(self, source, topology, resolver)
    }
}

fn required<'a>(source: &'a Value, path: &'static str) -> Result<&'a str, Skip> {
    lookup_str(source, path).ok_or(Skip::Incomplete(path))
}

fn geo_value(info: &GeoInfo) -> Value {
    serde_json::to_value(info).unwrap_or_default()
}

/// 按出接口匹配；入方向的条目也可按入接口匹配
fn match_flow_entry<'t>(
    source: &Value,
    host_ip: &str,
    topology: &'t TopologyMap,
) -> Option<&'t TopologyEntry> {
    let interface = |path: &str| lookup_path(source, path).and_then(scalar_to_key);

    let by_output = interface("output_interface_value")
        .and_then(|iface| topology.get(host_ip, Some(iface.as_str())));
    by_output.or_else(|| {
        interface("input_interface_value")
            .and_then(|iface| topology.get(host_ip, Some(iface.as_str())))
            .filter(|entry| entry.is_inbound())
    })
}

fn derive_flow(
    variant: &Variant,
    source: &Value,
    topology: &TopologyMap,
    resolver: &mut CycleResolver<'_>,
) -> Result<Map<String, Value>, Skip> {
    let host_ip = required(source, "host.ip")?;
    let entry = match_flow_entry(source, host_ip, topology).ok_or(Skip::Unmatched)?;
    let src_ip = required(source, "src_ip")?;
    let dst_ip = required(source, "dst_ip")?;

    let agent = resolver.resolve(&entry.agent_ip);
    let src = resolver.resolve(src_ip);
    let dst = resolver.resolve(dst_ip);
    let ip_type = if is_ipv4(dst_ip) { "ipv4" } else { "ipv6" };

    let mut doc = Map::new();
    doc.insert(
        "flow_isp_type".into(),
        Value::String((variant.classify)(&agent, &dst).to_string()),
    );
    doc.insert("flow_isp_info".into(), geo_value(&dst));
    doc.insert("flow_isp_info_src".into(), geo_value(&src));
    doc.insert("customer".into(), json!(entry.customer));
    doc.insert("node".into(), json!(entry.node));
    doc.insert("ipType".into(), json!(ip_type));
    doc.insert("sw_interface".into(), json!(entry.switch));
    doc.insert("src_ip_region".into(), json!(src.region_label(src_ip)));
    doc.insert("dst_ip_region".into(), json!(dst.region_label(dst_ip)));
    doc.insert("flow_direction".into(), json!(entry.flow_direction));
    Ok(doc)
}

fn derive_bandwidth(
    variant: &Variant,
    source: &Value,
    topology: &TopologyMap,
    resolver: &mut CycleResolver<'_>,
) -> Result<Map<String, Value>, Skip> {
    let host_ip = required(source, "host.ip")?;
    let entry = topology.get(host_ip, None).ok_or(Skip::Unmatched)?;
    let local_ip = required(source, "in_src")?;
    let remote_ip = required(source, "in_dst")?;

    let agent = resolver.resolve(&entry.agent_ip);
    let local = resolver.resolve(local_ip);
    let remote = resolver.resolve(remote_ip);
    let or_unknown = |v: Option<&String>| json!(v.map(String::as_str).unwrap_or(UNKNOWN));

    let mut doc = Map::new();
    doc.insert("host_name".into(), or_unknown(entry.host_name.as_ref()));
    doc.insert("node".into(), json!(entry.node));
    doc.insert("customer".into(), json!(entry.customer));
    doc.insert("interface".into(), or_unknown(entry.interface.as_ref()));
    doc.insert("local_ip_region".into(), json!(local.province));
    doc.insert("remote_ip_region".into(), json!(remote.province));
    doc.insert("local_ip_isp".into(), json!(normalize_isp(&local.isp)));
    doc.insert("remote_ip_isp".into(), json!(normalize_isp(&remote.isp)));
    doc.insert("local_ip_region_full".into(), json!(local.region_label(local_ip)));
    doc.insert("remote_ip_region_full".into(), json!(remote.region_label(remote_ip)));
    doc.insert("local_ip_info".into(), geo_value(&local));
    doc.insert("remote_ip_info".into(), geo_value(&remote));
    doc.insert(
        "flow_isp_type".into(),
        Value::String((variant.classify)(&agent, &remote).to_string()),
    );
    Ok(doc)
}
