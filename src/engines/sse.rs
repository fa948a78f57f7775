// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use serde::Deserialize;
use serde_json::Value;

use crate::domain::models::progress::StageEvent;
use crate::domain::models::task::Artifact;

/// 生成后端流式响应中的事件
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// 开始执行节点
    Executing { node: String },
    /// 节点步进进度
    Progress { node: String, value: u32, max: u32 },
    /// 节点执行完成，可能携带产物
    Executed {
        node: Option<String>,
        artifact: Option<Artifact>,
    },
    /// 整个流程执行成功
    Success,
    /// 执行错误
    Error {
        node: Option<String>,
        message: String,
    },
    /// 不关心的事件类型
    Other(String),
}

impl BackendEvent {
    /// 转换为进度跟踪器使用的阶段事件
    pub fn stage_event(&self) -> Option<StageEvent> {
        match self {
            BackendEvent::Executing { node } => Some(StageEvent::Started {
                stage: node.clone(),
            }),
            BackendEvent::Progress { node, value, max } => Some(StageEvent::Step {
                stage: node.clone(),
                step: *value,
                total: *max,
            }),
            BackendEvent::Success => Some(StageEvent::Finished),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// 解析一行 SSE 文本
///
/// # 返回值
///
/// * `None` - 非 `data:` 行（注释、空行、其他字段）
/// * `Some(Err(_))` - `data:` 负载不是合法 JSON 事件
pub fn parse_line(line: &str) -> Option<Result<BackendEvent, serde_json::Error>> {
    let payload = line.trim_end_matches('\r').strip_prefix("data:")?.trim_start();
    if payload.is_empty() {
        return None;
    }
    Some(serde_json::from_str::<RawEvent>(payload).map(into_event))
}

fn into_event(raw: RawEvent) -> BackendEvent {
    let data = &raw.data;
    match raw.kind.as_str() {
        "executing" => match node_id(&data["node"]) {
            Some(node) => BackendEvent::Executing { node },
            // node 为空表示执行结束
            None => BackendEvent::Other(raw.kind),
        },
        "progress" => BackendEvent::Progress {
            node: node_id(&data["node"]).unwrap_or_default(),
            value: saturating_u32(&data["value"]),
            max: saturating_u32(&data["max"]),
        },
        "executed" => BackendEvent::Executed {
            node: node_id(&data["node"]),
            artifact: artifact_from_output(&data["output"]),
        },
        "execution_success" => BackendEvent::Success,
        "execution_error" => BackendEvent::Error {
            node: node_id(&data["node_id"]),
            message: data["exception_message"]
                .as_str()
                .unwrap_or("unknown backend error")
                .to_string(),
        },
        _ => BackendEvent::Other(raw.kind),
    }
}

fn saturating_u32(value: &Value) -> u32 {
    value
        .as_u64()
        .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

fn node_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn artifact_from_output(output: &Value) -> Option<Artifact> {
    if let Some(uri) = output["gifs"][0]["fullpath"].as_str() {
        return Some(Artifact {
            uri: uri.to_string(),
            metadata: output["gifs"][0].clone(),
        });
    }

    let image = &output["images"][0];
    let uri = match image {
        Value::String(s) => Some(s.clone()),
        Value::Object(_) => ["fullpath", "url", "filename"]
            .iter()
            .find_map(|field| image[*field].as_str())
            .map(str::to_string),
        _ => None,
    }?;
    Some(Artifact {
        uri,
        metadata: image.clone(),
    })
}

/// 单行允许的最大字节数
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// 按行切分字节流
///
/// 保留跨块的不完整行，直到收到换行符。超过长度上限的行整行丢弃。
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    limit: usize,
    overflowed: bool,
    dropped: u64,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            limit,
            overflowed: false,
            dropped: 0,
        }
    }

    /// 追加一块数据并取出全部完整行
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let head = &rest[..pos];
            rest = &rest[pos + 1..];
            if self.overflowed {
                // 超长行的剩余部分
                self.overflowed = false;
            } else if self.pending.len() + head.len() > self.limit {
                self.dropped += 1;
            } else {
                self.pending.extend_from_slice(head);
                lines.push(String::from_utf8_lossy(&self.pending).into_owned());
            }
            self.pending.clear();
        }

        if !self.overflowed {
            if self.pending.len() + rest.len() > self.limit {
                self.overflowed = true;
                self.dropped += 1;
                self.pending.clear();
            } else {
                self.pending.extend_from_slice(rest);
            }
        }
        lines
    }

    /// 取出流结束时剩余的不完整行
    pub fn finish(&mut self) -> Option<String> {
        self.overflowed = false;
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    /// 因超长被丢弃的行数
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
