/// Deserialization checks for representative stream-json records.
#[cfg(test)]
mod unit {
    use crate::types::{ContentBlock, Message};

    fn parse(json: &str) -> Message {
        serde_json::from_str(json).expect("failed to parse message")
    }

    #[test]
    fn system_init_keeps_session_and_permission_mode() {
        let msg = parse(
            r#"{"type":"system","subtype":"init","session_id":"abc","permissionMode":"acceptEdits","tools":["Read"]}"#,
        );
        let Message::System(sys) = &msg else {
            panic!("expected System")
        };
        assert_eq!(sys.subtype, "init");
        assert_eq!(sys.permission_mode.as_deref(), Some("acceptEdits"));
        assert_eq!(msg.session_id(), Some("abc"));
    }

    #[test]
    fn assistant_text_joins_text_blocks_only() {
        let msg = parse(
            r#"{"type":"assistant","session_id":"s","message":{"content":[
                {"type":"text","text":"first"},
                {"type":"tool_use","id":"t1","name":"Edit","input":{"file":"a.py"}},
                {"type":"text","text":"second"}
            ]}}"#,
        );
        assert_eq!(msg.assistant_text().as_deref(), Some("first\nsecond"));
    }

    #[test]
    fn unknown_content_block_is_tolerated() {
        let msg = parse(
            r#"{"type":"assistant","message":{"content":[{"type":"server_tool_use","id":"x"}]}}"#,
        );
        let Message::Assistant(a) = msg else {
            panic!("expected Assistant")
        };
        assert!(matches!(a.message.content[0], ContentBlock::Other));
    }

    #[test]
    fn result_success_exposes_text() {
        let msg = parse(
            r#"{"type":"result","subtype":"success","session_id":"s","is_error":false,"result":"Status: Ready for Review","num_turns":3,"duration_ms":1200,"total_cost_usd":0.02}"#,
        );
        let r = msg.as_result().unwrap();
        assert!(!r.is_error());
        assert_eq!(r.text(), Some("Status: Ready for Review"));
        assert_eq!(r.num_turns, 3);
    }

    #[test]
    fn result_error_subtype_hides_text() {
        let msg = parse(
            r#"{"type":"result","subtype":"error_max_turns","session_id":"s","is_error":true,"num_turns":50,"errors":["max turns"]}"#,
        );
        let r = msg.as_result().unwrap();
        assert!(r.is_error());
        assert_eq!(r.text(), None);
        assert_eq!(r.errors, vec!["max turns".to_string()]);
    }

    #[test]
    fn result_with_error_flag_but_success_subtype_is_error() {
        let msg = parse(
            r#"{"type":"result","subtype":"success","session_id":"s","is_error":true,"result":"API Error"}"#,
        );
        assert!(msg.as_result().unwrap().is_error());
    }
}
