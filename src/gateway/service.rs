use tracing::{info, warn};

const SEGMENT_SIZE: usize = 8000;

/// 分段打印大字符串，避免日志截断；切分点对齐到 UTF-8 字符边界
pub fn log_in_segments(label: &str, body: &str) {
    let len = body.len();
    info!("=== {} (共 {} 字节) ===", label, len);

    if len <= SEGMENT_SIZE {
        info!("{}", body);
    } else {
        let segments = split_segments(body);
        let total = segments.len();
        for (i, segment) in segments.into_iter().enumerate() {
            info!("--- 第 {}/{} 段 ---\n{}", i + 1, total, segment);
        }
    }
    info!("=== {}结束 ===", label);
}

fn split_segments(body: &str) -> Vec<&str> {
    let len = body.len();
    let mut segments = Vec::with_capacity(len.div_ceil(SEGMENT_SIZE));
    let mut start = 0;

    while start < len {
        let end = body.floor_char_boundary((start + SEGMENT_SIZE).min(len));
        let Some(segment) = body.get(start..end).filter(|s| !s.is_empty()) else {
            warn!("无法获取偏移 {} 处的内容", start);
            break;
        };
        segments.push(segment);
        start = end;
    }
    segments
}

pub fn log_request_body(body: &str) {
    log_in_segments("请求体", body);
}

pub fn log_response_body(body: &str) {
    log_in_segments("响应体", body);
}
