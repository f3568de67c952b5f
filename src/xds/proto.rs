//! Protobuf encoding for the aggregated discovery envelope.
//!
//! Manual prost::Message implementations for the handful of messages the
//! discovery stream exchanges, field-compatible with
//! `envoy.service.discovery.v3`. Unused fields of the upstream messages are
//! skipped on decode.

use prost::{DecodeError, Message};

// ============================================================================
// Any
// ============================================================================

/// Wire-format google.protobuf.Any.
#[derive(Clone, Default, Debug, PartialEq)]
pub struct Any {
    pub type_url: String, // field 1
    pub value: Vec<u8>,   // field 2
}

impl Message for Any {
    fn encode_raw(&self, buf: &mut impl prost::bytes::BufMut)
    where
        Self: Sized,
    {
        if !self.type_url.is_empty() {
            prost::encoding::string::encode(1, &self.type_url, buf);
        }
        if !self.value.is_empty() {
            prost::encoding::bytes::encode(2, &self.value, buf);
        }
    }

    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: prost::encoding::WireType,
        buf: &mut impl prost::bytes::Buf,
        ctx: prost::encoding::DecodeContext,
    ) -> Result<(), DecodeError>
    where
        Self: Sized,
    {
        match tag {
            1 => prost::encoding::string::merge(wire_type, &mut self.type_url, buf, ctx),
            2 => prost::encoding::bytes::merge(wire_type, &mut self.value, buf, ctx),
            _ => prost::encoding::skip_field(wire_type, tag, buf, ctx),
        }
    }

    fn encoded_len(&self) -> usize {
        let mut len = 0;
        if !self.type_url.is_empty() {
            len += prost::encoding::string::encoded_len(1, &self.type_url);
        }
        if !self.value.is_empty() {
            len += prost::encoding::bytes::encoded_len(2, &self.value);
        }
        len
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

// ============================================================================
// Status
// ============================================================================

/// Wire-format google.rpc.Status carried as a NACK's error detail.
#[derive(Clone, Default, Debug, PartialEq)]
pub struct Status {
    pub code: i32,       // field 1
    pub message: String, // field 2
}

impl Message for Status {
    fn encode_raw(&self, buf: &mut impl prost::bytes::BufMut)
    where
        Self: Sized,
    {
        if self.code != 0 {
            prost::encoding::int32::encode(1, &self.code, buf);
        }
        if !self.message.is_empty() {
            prost::encoding::string::encode(2, &self.message, buf);
        }
    }

    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: prost::encoding::WireType,
        buf: &mut impl prost::bytes::Buf,
        ctx: prost::encoding::DecodeContext,
    ) -> Result<(), DecodeError>
    where
        Self: Sized,
    {
        match tag {
            1 => prost::encoding::int32::merge(wire_type, &mut self.code, buf, ctx),
            2 => prost::encoding::string::merge(wire_type, &mut self.message, buf, ctx),
            _ => prost::encoding::skip_field(wire_type, tag, buf, ctx),
        }
    }

    fn encoded_len(&self) -> usize {
        let mut len = 0;
        if self.code != 0 {
            len += prost::encoding::int32::encoded_len(1, &self.code);
        }
        if !self.message.is_empty() {
            len += prost::encoding::string::encoded_len(2, &self.message);
        }
        len
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

// ============================================================================
// Node
// ============================================================================

/// Wire-format envoy.config.core.v3.Node (identity fields only).
#[derive(Clone, Default, Debug, PartialEq)]
pub struct Node {
    pub id: String,      // field 1
    pub cluster: String, // field 2
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cluster: String::new(),
        }
    }
}

impl Message for Node {
    fn encode_raw(&self, buf: &mut impl prost::bytes::BufMut)
    where
        Self: Sized,
    {
        if !self.id.is_empty() {
            prost::encoding::string::encode(1, &self.id, buf);
        }
        if !self.cluster.is_empty() {
            prost::encoding::string::encode(2, &self.cluster, buf);
        }
    }

    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: prost::encoding::WireType,
        buf: &mut impl prost::bytes::Buf,
        ctx: prost::encoding::DecodeContext,
    ) -> Result<(), DecodeError>
    where
        Self: Sized,
    {
        match tag {
            1 => prost::encoding::string::merge(wire_type, &mut self.id, buf, ctx),
            2 => prost::encoding::string::merge(wire_type, &mut self.cluster, buf, ctx),
            _ => prost::encoding::skip_field(wire_type, tag, buf, ctx),
        }
    }

    fn encoded_len(&self) -> usize {
        let mut len = 0;
        if !self.id.is_empty() {
            len += prost::encoding::string::encoded_len(1, &self.id);
        }
        if !self.cluster.is_empty() {
            len += prost::encoding::string::encoded_len(2, &self.cluster);
        }
        len
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

// ============================================================================
// ControlPlane
// ============================================================================

/// Wire-format envoy.config.core.v3.ControlPlane.
#[derive(Clone, Default, Debug, PartialEq)]
pub struct ControlPlane {
    pub identifier: String, // field 1
}

impl Message for ControlPlane {
    fn encode_raw(&self, buf: &mut impl prost::bytes::BufMut)
    where
        Self: Sized,
    {
        if !self.identifier.is_empty() {
            prost::encoding::string::encode(1, &self.identifier, buf);
        }
    }

    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: prost::encoding::WireType,
        buf: &mut impl prost::bytes::Buf,
        ctx: prost::encoding::DecodeContext,
    ) -> Result<(), DecodeError>
    where
        Self: Sized,
    {
        match tag {
            1 => prost::encoding::string::merge(wire_type, &mut self.identifier, buf, ctx),
            _ => prost::encoding::skip_field(wire_type, tag, buf, ctx),
        }
    }

    fn encoded_len(&self) -> usize {
        if self.identifier.is_empty() {
            0
        } else {
            prost::encoding::string::encoded_len(1, &self.identifier)
        }
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

// ============================================================================
// DiscoveryRequest
// ============================================================================

/// Wire-format envoy.service.discovery.v3.DiscoveryRequest.
#[derive(Clone, Default, Debug, PartialEq)]
pub struct DiscoveryRequest {
    pub version_info: String,         // field 1
    pub node: Option<Node>,           // field 2
    pub resource_names: Vec<String>,  // field 3
    pub type_url: String,             // field 4
    pub response_nonce: String,       // field 5
    pub error_detail: Option<Status>, // field 6
}

impl DiscoveryRequest {
    /// True when the client rejected the response named by `response_nonce`.
    pub fn is_nack(&self) -> bool {
        self.error_detail.is_some()
    }
}

impl Message for DiscoveryRequest {
    fn encode_raw(&self, buf: &mut impl prost::bytes::BufMut)
    where
        Self: Sized,
    {
        if !self.version_info.is_empty() {
            prost::encoding::string::encode(1, &self.version_info, buf);
        }
        if let Some(ref node) = self.node {
            prost::encoding::message::encode(2, node, buf);
        }
        prost::encoding::string::encode_repeated(3, &self.resource_names, buf);
        if !self.type_url.is_empty() {
            prost::encoding::string::encode(4, &self.type_url, buf);
        }
        if !self.response_nonce.is_empty() {
            prost::encoding::string::encode(5, &self.response_nonce, buf);
        }
        if let Some(ref error_detail) = self.error_detail {
            prost::encoding::message::encode(6, error_detail, buf);
        }
    }

    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: prost::encoding::WireType,
        buf: &mut impl prost::bytes::Buf,
        ctx: prost::encoding::DecodeContext,
    ) -> Result<(), DecodeError>
    where
        Self: Sized,
    {
        match tag {
            1 => prost::encoding::string::merge(wire_type, &mut self.version_info, buf, ctx),
            2 => {
                let mut node = self.node.take().unwrap_or_default();
                prost::encoding::message::merge(wire_type, &mut node, buf, ctx)?;
                self.node = Some(node);
                Ok(())
            }
            3 => prost::encoding::string::merge_repeated(
                wire_type,
                &mut self.resource_names,
                buf,
                ctx,
            ),
            4 => prost::encoding::string::merge(wire_type, &mut self.type_url, buf, ctx),
            5 => prost::encoding::string::merge(wire_type, &mut self.response_nonce, buf, ctx),
            6 => {
                let mut status = self.error_detail.take().unwrap_or_default();
                prost::encoding::message::merge(wire_type, &mut status, buf, ctx)?;
                self.error_detail = Some(status);
                Ok(())
            }
            _ => prost::encoding::skip_field(wire_type, tag, buf, ctx),
        }
    }

    fn encoded_len(&self) -> usize {
        let mut len = 0;
        if !self.version_info.is_empty() {
            len += prost::encoding::string::encoded_len(1, &self.version_info);
        }
        if let Some(ref node) = self.node {
            len += prost::encoding::message::encoded_len(2, node);
        }
        len += prost::encoding::string::encoded_len_repeated(3, &self.resource_names);
        if !self.type_url.is_empty() {
            len += prost::encoding::string::encoded_len(4, &self.type_url);
        }
        if !self.response_nonce.is_empty() {
            len += prost::encoding::string::encoded_len(5, &self.response_nonce);
        }
        if let Some(ref error_detail) = self.error_detail {
            len += prost::encoding::message::encoded_len(6, error_detail);
        }
        len
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

// ============================================================================
// DiscoveryResponse
// ============================================================================

/// Wire-format envoy.service.discovery.v3.DiscoveryResponse.
#[derive(Clone, Default, Debug, PartialEq)]
pub struct DiscoveryResponse {
    pub version_info: String,                // field 1
    pub resources: Vec<Any>,                 // field 2
    pub canary: bool,                        // field 3
    pub type_url: String,                    // field 4
    pub nonce: String,                       // field 5
    pub control_plane: Option<ControlPlane>, // field 6
}

impl Message for DiscoveryResponse {
    fn encode_raw(&self, buf: &mut impl prost::bytes::BufMut)
    where
        Self: Sized,
    {
        if !self.version_info.is_empty() {
            prost::encoding::string::encode(1, &self.version_info, buf);
        }
        for resource in &self.resources {
            prost::encoding::message::encode(2, resource, buf);
        }
        if self.canary {
            prost::encoding::bool::encode(3, &self.canary, buf);
        }
        if !self.type_url.is_empty() {
            prost::encoding::string::encode(4, &self.type_url, buf);
        }
        if !self.nonce.is_empty() {
            prost::encoding::string::encode(5, &self.nonce, buf);
        }
        if let Some(ref control_plane) = self.control_plane {
            prost::encoding::message::encode(6, control_plane, buf);
        }
    }

    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: prost::encoding::WireType,
        buf: &mut impl prost::bytes::Buf,
        ctx: prost::encoding::DecodeContext,
    ) -> Result<(), DecodeError>
    where
        Self: Sized,
    {
        match tag {
            1 => prost::encoding::string::merge(wire_type, &mut self.version_info, buf, ctx),
            2 => {
                let mut resource = Any::default();
                prost::encoding::message::merge(wire_type, &mut resource, buf, ctx)?;
                self.resources.push(resource);
                Ok(())
            }
            3 => prost::encoding::bool::merge(wire_type, &mut self.canary, buf, ctx),
            4 => prost::encoding::string::merge(wire_type, &mut self.type_url, buf, ctx),
            5 => prost::encoding::string::merge(wire_type, &mut self.nonce, buf, ctx),
            6 => {
                let mut control_plane = self.control_plane.take().unwrap_or_default();
                prost::encoding::message::merge(wire_type, &mut control_plane, buf, ctx)?;
                self.control_plane = Some(control_plane);
                Ok(())
            }
            _ => prost::encoding::skip_field(wire_type, tag, buf, ctx),
        }
    }

    fn encoded_len(&self) -> usize {
        let mut len = 0;
        if !self.version_info.is_empty() {
            len += prost::encoding::string::encoded_len(1, &self.version_info);
        }
        for resource in &self.resources {
            len += prost::encoding::message::encoded_len(2, resource);
        }
        if self.canary {
            len += prost::encoding::bool::encoded_len(3, &self.canary);
        }
        if !self.type_url.is_empty() {
            len += prost::encoding::string::encoded_len(4, &self.type_url);
        }
        if !self.nonce.is_empty() {
            len += prost::encoding::string::encoded_len(5, &self.nonce);
        }
        if let Some(ref control_plane) = self.control_plane {
            len += prost::encoding::message::encoded_len(6, control_plane);
        }
        len
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nack_survives_the_wire() {
        let request = DiscoveryRequest {
            version_info: "abc".into(),
            node: Some(Node::new("n1")),
            resource_names: vec!["a".into(), "b".into()],
            type_url: "type.googleapis.com/envoy.config.cluster.v3.Cluster".into(),
            response_nonce: "7".into(),
            error_detail: Some(Status {
                code: 3,
                message: "bad cluster".into(),
            }),
        };
        let bytes = request.encode_to_vec();
        assert_eq!(bytes.len(), request.encoded_len());

        let decoded = DiscoveryRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, request);
        assert!(decoded.is_nack());
    }

    #[test]
    fn unknown_node_fields_are_skipped() {
        // Node { id: "n1", user_agent_name (field 6): "envoy" }
        let mut bytes = Vec::new();
        prost::encoding::string::encode(1, &"n1".to_string(), &mut bytes);
        prost::encoding::string::encode(6, &"envoy".to_string(), &mut bytes);

        let node = Node::decode(bytes.as_slice()).unwrap();
        assert_eq!(node.id, "n1");
        assert!(node.cluster.is_empty());
    }

    #[test]
    fn response_carries_resources_in_order() {
        let response = DiscoveryResponse {
            version_info: "v".into(),
            resources: vec![
                Any {
                    type_url: "t".into(),
                    value: b"{\"name\":\"a\"}".to_vec(),
                },
                Any {
                    type_url: "t".into(),
                    value: b"{\"name\":\"b\"}".to_vec(),
                },
            ],
            type_url: "t".into(),
            nonce: "1".into(),
            control_plane: Some(ControlPlane {
                identifier: "tessera".into(),
            }),
            ..Default::default()
        };
        let decoded = DiscoveryResponse::decode(response.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, response);
    }
}
