//! 上游行流 → `OpenAI` 响应转换
//!
//! 上游返回按行分隔的事件流，每行带 6 个字符的前缀（`data: `）。
//! - 流式：每个非空、非限流标记的行转换为一个 `chat.completion.chunk` SSE 事件，
//!   结束时追加 `data: [DONE]`
//! - 非流式：拼接所有行内容，生成单个 `chat.completion`
//!
//! 全程按行拉取，内存中最多保留一行未消费的数据。

use std::{fmt::Display, pin::Pin};

use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use thiserror::Error;

use super::model::CompletionChunk;

/// 上游行前缀长度（按字符计）
const PREFIX_CHARS: usize = 6;
/// 上游限流标记，去前缀后与之完全相等的行不输出
pub const TRYLIMIT_SENTINEL: &str = " trylimit";
/// SSE 结束事件
pub const DONE_EVENT: &[u8] = b"data: [DONE]\n\n";

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("upstream line is not valid UTF-8: {0}")]
    Decode(#[from] std::string::FromUtf8Error),
    #[error("failed to read upstream body: {0}")]
    Read(String),
    #[error("failed to encode chunk: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, TranslateError>> + Send>>;

/// 去掉固定前缀；不足 6 个字符的行视为空内容
pub fn strip_prefix(line: &str) -> &str {
    line.char_indices()
        .nth(PREFIX_CHARS)
        .map_or("", |(idx, _)| &line[idx..])
}

/// 把两个字符的 `\n` 转义替换为真实换行
pub fn unescape_newlines(content: &str) -> String {
    content.replace("\\n", "\n")
}

pub fn is_sentinel(content: &str) -> bool {
    content == TRYLIMIT_SENTINEL
}

/// 单行在流式模式下应输出的内容；空行与限流标记返回 `None`
pub fn stream_content(line: &str) -> Option<String> {
    if line.is_empty() {
        return None;
    }
    let content = strip_prefix(line);
    if is_sentinel(content) {
        return None;
    }
    Some(unescape_newlines(content))
}

struct LineReader<S> {
    body: S,
    buf: Vec<u8>,
    /// `buf[..searched]` 中确认没有行结束符
    searched: usize,
    finished: bool,
}

impl<S> LineReader<S> {
    /// 取出下一行，行结束符为 `\n`、`\r\n` 或单独的 `\r`
    ///
    /// 缓冲区末尾的 `\r` 要等到下一块数据（或流结束）才能确定是否与 `\n` 成对。
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let Some(offset) = self.buf[self.searched..]
            .iter()
            .position(|b| matches!(b, b'\n' | b'\r'))
        else {
            self.searched = self.buf.len();
            return None;
        };
        let pos = self.searched + offset;

        let terminator_len = if self.buf[pos] == b'\r' {
            match self.buf.get(pos + 1) {
                Some(b'\n') => 2,
                Some(_) => 1,
                None if self.finished => 1,
                None => {
                    self.searched = pos;
                    return None;
                }
            }
        } else {
            1
        };

        let mut line: Vec<u8> = self.buf.drain(..pos + terminator_len).collect();
        line.truncate(pos);
        self.searched = 0;
        Some(line)
    }
}

/// 把上游字节流切分为文本行
///
/// 以 `\n`、`\r\n` 或单独的 `\r` 分行；末尾没有换行的残余数据作为最后一行输出。
/// 读取出错后输出一次错误并结束。
pub fn upstream_lines<S, E>(body: S) -> LineStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    let reader = LineReader {
        body,
        buf: Vec::new(),
        searched: 0,
        finished: false,
    };

    Box::pin(stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(line) = reader.take_line() {
                return Some((String::from_utf8(line).map_err(TranslateError::from), reader));
            }
            if reader.finished {
                if reader.buf.is_empty() {
                    return None;
                }
                let rest = std::mem::take(&mut reader.buf);
                return Some((String::from_utf8(rest).map_err(TranslateError::from), reader));
            }
            match reader.body.next().await {
                Some(Ok(bytes)) => reader.buf.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    reader.finished = true;
                    reader.buf.clear();
                    return Some((Err(TranslateError::Read(e.to_string())), reader));
                }
                None => reader.finished = true,
            }
        }
    }))
}

/// 编码单个 SSE chunk 事件
pub fn encode_chunk(model: &str, content: &str) -> Result<Bytes, TranslateError> {
    let json = serde_json::to_string(&CompletionChunk::new(model, content))?;
    Ok(Bytes::from(format!("data: {json}\n\n")))
}

struct SseState {
    lines: LineStream,
    model: String,
    emitted: usize,
    finished: bool,
}

/// 流式转换：上游行 → `OpenAI` SSE 事件
///
/// 正常结束时追加 `[DONE]`；遇到错误则输出错误后直接结束，不再追加 `[DONE]`。
/// 返回的流被丢弃时上游 body 随之释放。
pub fn sse_events(
    lines: LineStream,
    model: String,
) -> impl Stream<Item = Result<Bytes, TranslateError>> + Send {
    let state = SseState {
        lines,
        model,
        emitted: 0,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            match state.lines.next().await {
                Some(Ok(line)) => {
                    let Some(content) = stream_content(&line) else {
                        if !line.is_empty() {
                            tracing::debug!("🚦 丢弃上游限流标记");
                        }
                        continue;
                    };
                    state.emitted += 1;
                    let event = encode_chunk(&state.model, &content);
                    if event.is_err() {
                        state.finished = true;
                    }
                    return Some((event, state));
                }
                Some(Err(e)) => {
                    tracing::error!("上游流读取失败: {}", e);
                    state.finished = true;
                    return Some((Err(e), state));
                }
                None => {
                    tracing::info!("Stream completed: {} chunk(s)", state.emitted);
                    state.finished = true;
                    return Some((Ok(Bytes::from_static(DONE_EVENT)), state));
                }
            }
        }
    })
}

/// 非流式转换：读完全部上游行并拼接内容
///
/// `keep_sentinel` 为 `true` 时保留限流标记行（旧行为），否则与流式一致地丢弃。
/// 转义换行在拼接完成后统一替换，跨行的 `\` + `n` 同样会被合并为换行。
pub async fn collect_full_text(
    mut lines: LineStream,
    keep_sentinel: bool,
) -> Result<String, TranslateError> {
    let mut full = String::new();
    while let Some(line) = lines.next().await {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let content = strip_prefix(&line);
        if !keep_sentinel && is_sentinel(content) {
            tracing::debug!("🚦 丢弃上游限流标记");
            continue;
        }
        full.push_str(content);
    }
    Ok(unescape_newlines(&full))
}
