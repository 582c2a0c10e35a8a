//! Protocol layer tests: JSON-RPC serialization, errors, handshake types, versions.

#[cfg(test)]
mod tests {
    use serde_json::json;
    use srpc_protocol::*;

    // ─────────────────────────────────────────────────────────────────────
    // RequestId
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn request_id_number_and_string() {
        assert_eq!(serde_json::to_value(RequestId::Number(42)).unwrap(), json!(42));
        assert_eq!(serde_json::to_value(RequestId::String("abc".into())).unwrap(), json!("abc"));

        let id: RequestId = serde_json::from_value(json!("req-1")).unwrap();
        assert_eq!(id, RequestId::String("req-1".into()));
    }

    // ─────────────────────────────────────────────────────────────────────
    // RpcRequest
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn request_decoded_from_wire_format() {
        let text = json!({ "jsonrpc": "2.0", "id": 1, "method": "session/info" }).to_string();
        let req = RpcRequest::decode(&text).unwrap();
        assert_eq!(req, RpcRequest::new(RequestId::Number(1), "session/info", None));
        assert_eq!(req.namespace(), "session");
        assert!(!req.is_handshake());
    }

    #[test]
    fn handshake_request_params() {
        let text = json!({
            "jsonrpc": "2.0",
            "id": "hs",
            "method": "rpc/handshake",
            "params": { "version": "1.3" }
        })
        .to_string();
        let req = RpcRequest::decode(&text).unwrap();
        assert!(req.is_handshake());
        let params: HandshakeParams = req.params_as().unwrap();
        assert_eq!(params.version, ProtocolVersion::parse("1.3"));
    }

    #[test]
    fn request_wrong_version_or_empty_method() {
        for frame in [
            json!({ "jsonrpc": "1.0", "id": 2, "method": "echo/say" }),
            json!({ "jsonrpc": "2.0", "id": 2, "method": "" }),
            json!({ "id": 2, "method": "echo/say" }),
        ] {
            let resp = RpcRequest::decode(&frame.to_string()).unwrap_err();
            assert_eq!(resp.id, Some(RequestId::Number(2)), "{frame}");
            assert_eq!(resp.into_result().unwrap_err().code, -32600);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // RpcResponse
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn success_response_serialization() {
        let resp = RpcResponse::success(RequestId::Number(7), json!({"ok": true}));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 7);
        assert_eq!(json["result"]["ok"], true);
        assert!(json.get("error").is_none());
        assert!(!resp.is_error());
    }

    #[test]
    fn error_response_null_id() {
        let resp = RpcResponse::error(None, RpcError::parse_error("bad json"));
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json["id"].is_null());
        assert_eq!(json["error"]["code"], -32700);
        assert!(json.get("result").is_none());
        assert!(resp.is_error());
    }

    #[test]
    fn response_answers_the_request_id() {
        let req = RpcRequest::new(RequestId::String("x".into()), "nope/x", None);
        let resp = req.respond(Err(RpcError::method_not_found("nope/x"))).unwrap();
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["id"], "x");
        assert_eq!(json["error"]["code"], -32601);
    }

    #[test]
    fn response_parsed_back_from_wire() {
        let ok: RpcResponse =
            serde_json::from_value(json!({ "jsonrpc": "2.0", "id": 3, "result": [1, 2] })).unwrap();
        assert_eq!(ok.id, Some(RequestId::Number(3)));
        assert_eq!(ok.into_result().unwrap(), json!([1, 2]));

        let err: RpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": { "code": -32012, "message": "Handshake timeout" }
        }))
        .unwrap();
        assert_eq!(err.into_result().unwrap_err(), RpcError::handshake_timeout());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Notifications
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn notification_without_params() {
        let n = RpcNotification::new(Notifications::SERVER_CONNECTED, None);
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["method"], "server/connected");
        assert!(json.get("params").is_none());
        assert!(json.get("id").is_none());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Error codes
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn error_code_values() {
        assert_eq!(RpcErrorCode::ParseError.code(), -32700);
        assert_eq!(RpcErrorCode::InvalidRequest.code(), -32600);
        assert_eq!(RpcErrorCode::MethodNotFound.code(), -32601);
        assert_eq!(RpcErrorCode::InvalidParams.code(), -32602);
        assert_eq!(RpcErrorCode::InternalError.code(), -32603);
        assert_eq!(RpcErrorCode::Custom(-42).code(), -42);
    }

    #[test]
    fn error_code_roundtrip() {
        assert_eq!(RpcErrorCode::from_code(-32601), RpcErrorCode::MethodNotFound);
        assert_eq!(
            RpcErrorCode::from_code(-32014),
            RpcErrorCode::Handshake(HandshakeErrorCode::VersionMismatch)
        );
        assert_eq!(RpcErrorCode::from_code(-1), RpcErrorCode::Custom(-1));
    }

    #[test]
    fn error_display_and_data() {
        let e = RpcError::internal("detail").with_data(json!({"line": 42}));
        let s = format!("{e}");
        assert!(s.contains("-32603"));
        assert!(s.contains("detail"));
        assert_eq!(e.data.as_ref().unwrap()["line"], 42);
    }

    #[test]
    fn handshake_errors_use_reserved_codes() {
        assert_eq!(RpcError::not_negotiated().code, -32010);
        assert_eq!(RpcError::invalid_token().code, -32011);
        assert_eq!(RpcError::handshake_timeout().code, -32012);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Handshake
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn handshake_params_from_wire() {
        let params: HandshakeParams = serde_json::from_value(json!({
            "version": "1.2.0-beta",
            "token": "secret",
            "client": { "name": "cli" }
        }))
        .unwrap();
        assert_eq!(params.version.major(), 1);
        assert!(params.version.is_beta());
        assert_eq!(params.token.as_deref(), Some("secret"));
        assert_eq!(params.client.unwrap().name, "cli");
    }

    #[test]
    fn handshake_params_version_defaults_to_zero() {
        let params: HandshakeParams = serde_json::from_value(json!({})).unwrap();
        assert!(!params.version.is_parsed());
        assert_eq!(params.version, ProtocolVersion::default());
    }

    #[test]
    fn handshake_result_wire_names() {
        let result = HandshakeResult {
            connection_id: "c1".into(),
            server_version: ProtocolVersion::parse("1.4"),
            negotiated_version: ProtocolVersion::parse("1.2"),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["connectionId"], "c1");
        assert_eq!(json["serverVersion"], "1.4");
        assert_eq!(json["negotiatedVersion"], "1.2");
    }

    #[test]
    fn handshake_error_codes() {
        assert_eq!(HandshakeErrorCode::NotNegotiated.code(), -32010);
        assert_eq!(HandshakeErrorCode::InvalidToken.code(), -32011);
        assert_eq!(HandshakeErrorCode::HandshakeTimeout.code(), -32012);
        assert_eq!(HandshakeErrorCode::ConnectionRejected.code(), -32013);
        assert_eq!(HandshakeErrorCode::VersionMismatch.code(), -32014);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Versions
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn version_operators() {
        let a = ProtocolVersion::parse("1.2.3");
        let b = ProtocolVersion::parse("1.2.4");
        assert!(a < b);
        assert!(a <= b);
        assert!(b > a);
        assert!(b >= a);
        assert!(a != b);
        assert!(a == ProtocolVersion::parse("1.2.3"));
        assert!(a <= ProtocolVersion::parse("1.2.3"));
        assert!(a >= ProtocolVersion::parse("1.2.3"));
    }

    #[test]
    fn version_sorting() {
        let mut versions: Vec<ProtocolVersion> = ["1.1", "1.0", "1.1alpha", "2.0.0-beta", "2.0", ""]
            .into_iter()
            .map(ProtocolVersion::parse)
            .collect();
        versions.sort();
        let sorted: Vec<String> = versions.iter().map(|v| v.to_string()).collect();
        assert_eq!(sorted, vec!["", "1.0", "1.1alpha", "1.1", "2.0.0-beta", "2.0"]);
    }
}
