//! Juniper vendor extensions carried inside gNMI frames.

/// Header message Juniper devices attach to gNMI notifications as an
/// `Any`-typed update value.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GnmiJuniperTelemetryHeader {
    #[prost(string, tag = "1")]
    pub system_id: String,
    #[prost(uint32, tag = "2")]
    pub component_id: u32,
    #[prost(uint32, tag = "3")]
    pub sub_component_id: u32,
    /// Sensor path of the form `sensor:<internal>:</schema/path/>:<app>`.
    #[prost(string, tag = "4")]
    pub path: String,
    #[prost(uint64, tag = "5")]
    pub sequence_number: u64,
}

/// Fully-qualified message name used as the `Any` type URL suffix.
pub const JUNIPER_HEADER_TYPE: &str = "GnmiJuniperTelemetryHeader";

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn header_roundtrips_through_any() {
        let hdr = GnmiJuniperTelemetryHeader {
            system_id: "core1.lax".to_owned(),
            component_id: 1,
            sub_component_id: 0,
            path: "sensor_1000:/interfaces/interface/:/interfaces/interface/:mib2d".to_owned(),
            sequence_number: 42,
        };

        let any = prost_types::Any {
            type_url: format!("type.googleapis.com/{JUNIPER_HEADER_TYPE}"),
            value: hdr.encode_to_vec(),
        };

        assert!(any.type_url.ends_with(JUNIPER_HEADER_TYPE));
        let back = GnmiJuniperTelemetryHeader::decode(any.value.as_slice()).unwrap();
        assert_eq!(hdr, back);
    }
}
