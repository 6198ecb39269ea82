use super::header::{Envelope, OpCode};
use crate::errors::WireError;
use serde::Serialize;
use serde_json::{json, Value};

/// Pseudo-collection that carries the pop command.
pub const POP_COMMAND: &str = "$pop";

/// Flag asking the data node to return rows with the query reply itself.
pub const FLG_QUERY_WITH_RETURNDATA: i32 = 0x0000_0100;

/// Requests a session sends to its data node.
#[derive(Debug, Clone, PartialEq)]
pub enum DataNodeRequest {
    Query {
        collection: String,
        condition: Option<Value>,
        selector: Option<Value>,
        order_by: Option<Value>,
        skip: i64,
        limit: i64,
        flags: i32,
        /// Collection metadata version the query runs against, `-1` when unknown.
        version: i32,
    },
    GetMore {
        context_id: i64,
        num_to_return: i32,
    },
    KillContexts {
        context_ids: Vec<i64>,
    },
    /// Removes staging records up to `logical_id`.
    Pop {
        collection: String,
        logical_id: i64,
        direction: i32,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryBody<'a> {
    collection: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    condition: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    selector: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    order_by: Option<&'a Value>,
    skip: i64,
    limit: i64,
    flags: i32,
    version: i32,
}

impl DataNodeRequest {
    pub fn op_code(&self) -> OpCode {
        match self {
            Self::Query { .. } | Self::Pop { .. } => OpCode::Query,
            Self::GetMore { .. } => OpCode::GetMore,
            Self::KillContexts { .. } => OpCode::KillContext,
        }
    }

    pub fn encode(&self, tag: u32, request_id: u64) -> Result<Envelope, WireError> {
        let op_code = self.op_code();
        match self {
            Self::Query {
                collection,
                condition,
                selector,
                order_by,
                skip,
                limit,
                flags,
                version,
            } => {
                let body = QueryBody {
                    collection,
                    condition: condition.as_ref(),
                    selector: selector.as_ref(),
                    order_by: order_by.as_ref(),
                    skip: *skip,
                    limit: *limit,
                    flags: *flags,
                    version: *version,
                };
                Envelope::json(op_code, tag, request_id, &body)
            }
            Self::GetMore {
                context_id,
                num_to_return,
            } => Envelope::json(
                op_code,
                tag,
                request_id,
                &json!({ "contextId": context_id, "numToReturn": num_to_return }),
            ),
            Self::KillContexts { context_ids } => Envelope::json(
                op_code,
                tag,
                request_id,
                &json!({ "contextIds": context_ids }),
            ),
            Self::Pop {
                collection,
                logical_id,
                direction,
            } => {
                let condition = json!({
                    "Collection": collection,
                    "LogicalID": logical_id,
                    "Direction": direction,
                });
                let body = QueryBody {
                    collection: POP_COMMAND,
                    condition: Some(&condition),
                    selector: None,
                    order_by: None,
                    skip: 0,
                    limit: -1,
                    flags: 0,
                    version: -1,
                };
                Envelope::json(op_code, tag, request_id, &body)
            }
        }
    }
}
