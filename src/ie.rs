//! Information Element catalog: a representative subset of the IANA IPFIX
//! Information Element registry (http://www.iana.org/assignments/ipfix/ipfix.xml),
//! standing in for the external IE dictionary (spec §1, §6).
//!
//! Elements are identified on the wire by `(enterprise, id)` — not a closed
//! Rust enum — because arbitrary enterprise-specific elements must still
//! parse generically. This module only supplies human-readable names for
//! well-known (enterprise 0) elements, used in logs and by the NetFlow
//! converters when they synthesize templates that reference specific
//! elements by name (e.g. `flowStartMilliseconds`).

/// `(enterprise, element id)` — the wire identity of a Field Specifier
/// (spec §3 "Template").
pub type IeId = (u32, u16);

pub const IANA: u32 = 0;

pub const OCTET_DELTA_COUNT: IeId = (IANA, 1);
pub const PACKET_DELTA_COUNT: IeId = (IANA, 2);
pub const PROTOCOL_IDENTIFIER: IeId = (IANA, 4);
pub const IP_CLASS_OF_SERVICE: IeId = (IANA, 5);
pub const TCP_CONTROL_BITS: IeId = (IANA, 6);
pub const SOURCE_TRANSPORT_PORT: IeId = (IANA, 7);
pub const SOURCE_IPV4_ADDRESS: IeId = (IANA, 8);
pub const SOURCE_IPV4_PREFIX_LENGTH: IeId = (IANA, 9);
pub const INGRESS_INTERFACE: IeId = (IANA, 10);
pub const DESTINATION_TRANSPORT_PORT: IeId = (IANA, 11);
pub const DESTINATION_IPV4_ADDRESS: IeId = (IANA, 12);
pub const DESTINATION_IPV4_PREFIX_LENGTH: IeId = (IANA, 13);
pub const EGRESS_INTERFACE: IeId = (IANA, 14);
pub const IP_NEXT_HOP_IPV4_ADDRESS: IeId = (IANA, 15);
pub const BGP_SOURCE_AS_NUMBER: IeId = (IANA, 16);
pub const BGP_DESTINATION_AS_NUMBER: IeId = (IANA, 17);
pub const BGP_NEXT_HOP_IPV4_ADDRESS: IeId = (IANA, 18);
pub const FLOW_END_SYS_UP_TIME: IeId = (IANA, 21);
pub const FLOW_START_SYS_UP_TIME: IeId = (IANA, 22);
pub const SOURCE_IPV6_ADDRESS: IeId = (IANA, 27);
pub const DESTINATION_IPV6_ADDRESS: IeId = (IANA, 28);
pub const SOURCE_IPV6_PREFIX_LENGTH: IeId = (IANA, 29);
pub const DESTINATION_IPV6_PREFIX_LENGTH: IeId = (IANA, 30);
pub const ICMP_TYPE_CODE_IPV4: IeId = (IANA, 32);
pub const SAMPLING_INTERVAL: IeId = (IANA, 34);
pub const SAMPLING_ALGORITHM: IeId = (IANA, 35);
pub const ENGINE_TYPE: IeId = (IANA, 38);
pub const ENGINE_ID: IeId = (IANA, 39);
pub const SRC_MASK: IeId = (IANA, 9);
pub const DST_MASK: IeId = (IANA, 13);
pub const SOURCE_MAC_ADDRESS: IeId = (IANA, 56);
pub const DESTINATION_MAC_ADDRESS: IeId = (IANA, 80);
pub const OCTET_TOTAL_COUNT: IeId = (IANA, 85);
pub const PACKET_TOTAL_COUNT: IeId = (IANA, 86);
pub const EXPORTER_IPV4_ADDRESS: IeId = (IANA, 130);
pub const EXPORTER_IPV6_ADDRESS: IeId = (IANA, 131);
pub const FLOW_END_REASON: IeId = (IANA, 136);
pub const LINE_CARD_ID: IeId = (IANA, 141);
pub const EXPORTING_PROCESS_ID: IeId = (IANA, 144);
pub const TEMPLATE_ID: IeId = (IANA, 145);
pub const FLOW_START_SECONDS: IeId = (IANA, 150);
pub const FLOW_END_SECONDS: IeId = (IANA, 151);
pub const FLOW_START_MILLISECONDS: IeId = (IANA, 152);
pub const FLOW_END_MILLISECONDS: IeId = (IANA, 153);
pub const SYSTEM_INIT_TIME_MILLISECONDS: IeId = (IANA, 160);

/// A few elements whose IDs don't appear in the NetFlow converters but are
/// useful for the generic data-record printer / tests.
pub const IP_VERSION: IeId = (IANA, 60);
pub const FLOW_DIRECTION: IeId = (IANA, 61);
pub const VLAN_ID: IeId = (IANA, 58);

/// The v9 Options Template scope enumeration values that the converter must
/// recognize and remap to IANA Information Elements (spec §4.6).
pub mod v9_scope {
    pub const SYSTEM: u16 = 1;
    pub const INTERFACE: u16 = 2;
    pub const LINE_CARD: u16 = 3;
    pub const CACHE: u16 = 4;
    pub const TEMPLATE: u16 = 5;
}

/// Returns a human-readable name for a well-known (enterprise 0) element,
/// or `None` if it isn't in this representative catalog.
pub fn name(id: IeId) -> Option<&'static str> {
    Some(match id {
        OCTET_DELTA_COUNT => "octetDeltaCount",
        PACKET_DELTA_COUNT => "packetDeltaCount",
        PROTOCOL_IDENTIFIER => "protocolIdentifier",
        IP_CLASS_OF_SERVICE => "ipClassOfService",
        TCP_CONTROL_BITS => "tcpControlBits",
        SOURCE_TRANSPORT_PORT => "sourceTransportPort",
        SOURCE_IPV4_ADDRESS => "sourceIPv4Address",
        INGRESS_INTERFACE => "ingressInterface",
        DESTINATION_TRANSPORT_PORT => "destinationTransportPort",
        DESTINATION_IPV4_ADDRESS => "destinationIPv4Address",
        EGRESS_INTERFACE => "egressInterface",
        IP_NEXT_HOP_IPV4_ADDRESS => "ipNextHopIPv4Address",
        BGP_SOURCE_AS_NUMBER => "bgpSourceAsNumber",
        BGP_DESTINATION_AS_NUMBER => "bgpDestinationAsNumber",
        BGP_NEXT_HOP_IPV4_ADDRESS => "bgpNextHopIPv4Address",
        FLOW_END_SYS_UP_TIME => "flowEndSysUpTime",
        FLOW_START_SYS_UP_TIME => "flowStartSysUpTime",
        SOURCE_IPV6_ADDRESS => "sourceIPv6Address",
        DESTINATION_IPV6_ADDRESS => "destinationIPv6Address",
        ICMP_TYPE_CODE_IPV4 => "icmpTypeCodeIPv4",
        SAMPLING_INTERVAL => "samplingInterval",
        SAMPLING_ALGORITHM => "samplingAlgorithm",
        ENGINE_TYPE => "engineType",
        ENGINE_ID => "engineId",
        SOURCE_MAC_ADDRESS => "sourceMacAddress",
        DESTINATION_MAC_ADDRESS => "destinationMacAddress",
        OCTET_TOTAL_COUNT => "octetTotalCount",
        PACKET_TOTAL_COUNT => "packetTotalCount",
        EXPORTER_IPV4_ADDRESS => "exporterIPv4Address",
        EXPORTER_IPV6_ADDRESS => "exporterIPv6Address",
        FLOW_END_REASON => "flowEndReason",
        LINE_CARD_ID => "lineCardId",
        EXPORTING_PROCESS_ID => "exportingProcessId",
        TEMPLATE_ID => "templateId",
        FLOW_START_SECONDS => "flowStartSeconds",
        FLOW_END_SECONDS => "flowEndSeconds",
        FLOW_START_MILLISECONDS => "flowStartMilliseconds",
        FLOW_END_MILLISECONDS => "flowEndMilliseconds",
        SYSTEM_INIT_TIME_MILLISECONDS => "systemInitTimeMilliseconds",
        IP_VERSION => "ipVersion",
        FLOW_DIRECTION => "flowDirection",
        VLAN_ID => "vlanId",
        _ => return None,
    })
}

/// Formats an element id for logs: its name if known, else `e{ent}.{id}`.
pub fn display(id: IeId) -> String {
    match name(id) {
        Some(n) => n.to_string(),
        None => format!("e{}.{}", id.0, id.1),
    }
}

/// Remaps a NetFlow v9 Options Template scope enumeration value to the
/// IPFIX Information Element that represents the same scope (spec §4.6).
/// Returns `None` for an unrecognized scope, which marks the template
/// "drop" per spec.
pub fn v9_scope_to_ie(scope: u16) -> Option<IeId> {
    match scope {
        v9_scope::SYSTEM => Some(EXPORTING_PROCESS_ID),
        v9_scope::INTERFACE => Some(INGRESS_INTERFACE),
        v9_scope::LINE_CARD => Some(LINE_CARD_ID),
        v9_scope::TEMPLATE => Some(TEMPLATE_ID),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_element_has_name() {
        assert_eq!(name(SOURCE_IPV4_ADDRESS), Some("sourceIPv4Address"));
    }

    #[test]
    fn unknown_element_falls_back_to_numeric_display() {
        assert_eq!(display((0, 9999)), "e0.9999");
        assert_eq!(display((32473, 1)), "e32473.1");
    }

    #[test]
    fn scope_remap_matches_spec_table() {
        assert_eq!(v9_scope_to_ie(v9_scope::SYSTEM), Some(EXPORTING_PROCESS_ID));
        assert_eq!(v9_scope_to_ie(v9_scope::INTERFACE), Some(INGRESS_INTERFACE));
        assert_eq!(v9_scope_to_ie(v9_scope::LINE_CARD), Some(LINE_CARD_ID));
        assert_eq!(v9_scope_to_ie(v9_scope::TEMPLATE), Some(TEMPLATE_ID));
        assert_eq!(v9_scope_to_ie(v9_scope::CACHE), None);
        assert_eq!(v9_scope_to_ie(99), None);
    }
}
