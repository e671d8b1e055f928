//! 同网/异网判定

use std::fmt;

use crate::geo::{GeoInfo, UNKNOWN, normalize_isp};

/// 流量运营商类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowIspType {
    /// 同网省内
    SameNetworkInProvince,
    /// 同网跨省
    SameNetworkCrossProvince,
    /// 异网，携带目的端运营商（归一化后）
    OtherNetwork(String),
}

impl fmt::Display for FlowIspType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowIspType::SameNetworkInProvince => f.write_str("同网省内"),
            FlowIspType::SameNetworkCrossProvince => f.write_str("同网跨省"),
            FlowIspType::OtherNetwork(carrier) if carrier.is_empty() => {
                write!(f, "异网({})", UNKNOWN)
            }
            FlowIspType::OtherNetwork(carrier) => write!(f, "异网({})", carrier),
        }
    }
}

/// 以 agent 为基准判定去往目的端的流量类型
///
/// 只依赖两端的运营商与省份，与地址本身无关
pub fn classify(agent: &GeoInfo, dst: &GeoInfo) -> FlowIspType {
    let agent_isp = normalize_isp(&agent.isp);
    let dst_isp = normalize_isp(&dst.isp);

    if agent_isp != UNKNOWN && dst_isp != UNKNOWN && agent_isp == dst_isp {
        if agent.province == dst.province {
            FlowIspType::SameNetworkInProvince
        } else {
            FlowIspType::SameNetworkCrossProvince
        }
    } else {
        FlowIspType::OtherNetwork(dst_isp)
    }
}
