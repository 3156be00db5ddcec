// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>
//! The schema greeting sent as the first frame of every connection.
//!
//! This is a frozen constant: clients pin their decoders to it, so it only
//! changes together with the protocol version.

/// JSON description of the state-history wire schema, sent verbatim as the
/// one text frame of every session before binary framing starts.
pub const STATE_HISTORY_ABI: &str = r#"{
    "version": "vellum::abi/1.0",
    "types": [
        { "new_type_name": "block_id", "type": "checksum256" },
        { "new_type_name": "transaction_id", "type": "checksum256" },
        { "new_type_name": "chain_id", "type": "checksum256" }
    ],
    "structs": [
        {
            "name": "block_position", "fields": [
                { "name": "block_num", "type": "uint32" },
                { "name": "block_id", "type": "block_id" }
            ]
        },
        {
            "name": "get_status_request_v0", "fields": []
        },
        {
            "name": "get_blocks_request_v0", "fields": [
                { "name": "start_block_num", "type": "uint32" },
                { "name": "end_block_num", "type": "uint32" },
                { "name": "max_messages_in_flight", "type": "uint32" },
                { "name": "have_positions", "type": "block_position[]" },
                { "name": "irreversible_only", "type": "bool" },
                { "name": "fetch_block", "type": "bool" },
                { "name": "fetch_traces", "type": "bool" },
                { "name": "fetch_deltas", "type": "bool" }
            ]
        },
        {
            "name": "get_blocks_ack_request_v0", "fields": [
                { "name": "num_messages", "type": "uint32" }
            ]
        },
        {
            "name": "get_status_result_v0", "fields": [
                { "name": "head", "type": "block_position" },
                { "name": "last_irreversible", "type": "block_position" },
                { "name": "chain_id", "type": "chain_id" },
                { "name": "trace_begin_block", "type": "uint32" },
                { "name": "trace_end_block", "type": "uint32" },
                { "name": "chain_state_begin_block", "type": "uint32" },
                { "name": "chain_state_end_block", "type": "uint32" }
            ]
        },
        {
            "name": "get_blocks_result_v0", "fields": [
                { "name": "head", "type": "block_position" },
                { "name": "last_irreversible", "type": "block_position" },
                { "name": "this_block", "type": "block_position?" },
                { "name": "prev_block", "type": "block_position?" },
                { "name": "block", "type": "bytes?" },
                { "name": "traces", "type": "bytes?" },
                { "name": "deltas", "type": "bytes?" }
            ]
        },
        {
            "name": "log_entry_envelope", "fields": [
                { "name": "block_id", "type": "block_id" },
                { "name": "previous_id", "type": "block_id" },
                { "name": "body", "type": "bytes" }
            ]
        },
        {
            "name": "account_delta", "fields": [
                { "name": "account", "type": "string" },
                { "name": "delta", "type": "int64" }
            ]
        },
        {
            "name": "action_trace", "fields": [
                { "name": "receiver", "type": "string" },
                { "name": "action", "type": "string" },
                { "name": "data", "type": "bytes" },
                { "name": "console", "type": "string" }
            ]
        },
        {
            "name": "transaction_trace", "fields": [
                { "name": "id", "type": "transaction_id" },
                { "name": "status", "type": "uint8" },
                { "name": "cpu_usage_us", "type": "uint32" },
                { "name": "net_usage_words", "type": "varuint32" },
                { "name": "elapsed_us", "type": "uint64" },
                { "name": "scheduled", "type": "bool" },
                { "name": "action_traces", "type": "action_trace[]" },
                { "name": "account_ram_deltas", "type": "account_delta[]" },
                { "name": "error_message", "type": "string?" }
            ]
        },
        {
            "name": "row", "fields": [
                { "name": "present", "type": "bool" },
                { "name": "data", "type": "bytes" }
            ]
        },
        {
            "name": "table_delta", "fields": [
                { "name": "name", "type": "string" },
                { "name": "rows", "type": "row[]" }
            ]
        }
    ],
    "variants": [
        { "name": "request", "types": ["get_status_request_v0", "get_blocks_request_v0", "get_blocks_ack_request_v0"] },
        { "name": "result", "types": ["get_status_result_v0", "get_blocks_result_v0"] }
    ]
}"#;
