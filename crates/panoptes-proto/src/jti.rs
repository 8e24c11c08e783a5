//! Juniper OpenConfig Telemetry (JTI) types (package `telemetry`), subset of
//! the `oc.proto` shipped with Junos.

/// A subscription request carrying the sensor path list.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SubscriptionRequest {
    #[prost(message, repeated, tag = "2")]
    pub path_list: Vec<Path>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Path {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(uint32, tag = "5")]
    pub sample_frequency: u32,
}

/// One streamed telemetry frame.
#[derive(Clone, PartialEq, prost::Message)]
pub struct OpenConfigData {
    #[prost(string, tag = "1")]
    pub system_id: String,
    #[prost(uint32, tag = "2")]
    pub component_id: u32,
    #[prost(uint32, tag = "3")]
    pub sub_component_id: u32,
    #[prost(string, tag = "4")]
    pub path: String,
    #[prost(uint64, tag = "5")]
    pub sequence_number: u64,
    /// Milliseconds since the epoch.
    #[prost(uint64, tag = "6")]
    pub timestamp: u64,
    #[prost(message, repeated, tag = "7")]
    pub kv: Vec<KeyValue>,
    #[prost(bool, tag = "9")]
    pub sync_response: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct KeyValue {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(oneof = "key_value::Value", tags = "5, 6, 7, 8, 9, 10, 11")]
    pub value: Option<key_value::Value>,
}

pub mod key_value {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Value {
        #[prost(double, tag = "5")]
        DoubleValue(f64),
        #[prost(int64, tag = "6")]
        IntValue(i64),
        #[prost(uint64, tag = "7")]
        UintValue(u64),
        #[prost(sint64, tag = "8")]
        SintValue(i64),
        #[prost(bytes, tag = "9")]
        BytesValue(Vec<u8>),
        #[prost(string, tag = "10")]
        StrValue(String),
        #[prost(bool, tag = "11")]
        BoolValue(bool),
    }
}

/// Client for the `telemetry.OpenConfigTelemetry` service.
pub mod open_config_telemetry_client {
    use tonic::codegen::*;

    #[derive(Debug, Clone)]
    pub struct OpenConfigTelemetryClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl OpenConfigTelemetryClient<tonic::transport::Channel> {
        pub fn new(channel: tonic::transport::Channel) -> Self {
            Self {
                inner: tonic::client::Grpc::new(channel),
            }
        }
    }

    impl<T> OpenConfigTelemetryClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        /// Server-streaming subscription; the device pushes frames until the
        /// stream is torn down.
        pub async fn telemetry_subscribe(
            &mut self,
            request: impl tonic::IntoRequest<super::SubscriptionRequest>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<super::OpenConfigData>>,
            tonic::Status,
        > {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/telemetry.OpenConfigTelemetry/telemetrySubscribe",
            );
            let mut req = request.into_request();
            req.extensions_mut().insert(GrpcMethod::new(
                "telemetry.OpenConfigTelemetry",
                "telemetrySubscribe",
            ));
            self.inner.server_streaming(req, path, codec).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn frame_roundtrip() {
        let frame = OpenConfigData {
            system_id: "core1.lax".to_owned(),
            component_id: 65535,
            sub_component_id: 0,
            path: "sensor_1000:/interfaces/:/interfaces/:mib2d".to_owned(),
            sequence_number: 1,
            timestamp: 1_596_067_993_610,
            kv: vec![KeyValue {
                key: "in-octets".to_owned(),
                value: Some(key_value::Value::UintValue(1234)),
            }],
            sync_response: false,
        };

        let bytes = frame.encode_to_vec();
        let back = OpenConfigData::decode(bytes.as_slice()).unwrap();
        assert_eq!(frame, back);
    }
}
