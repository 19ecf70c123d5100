//! Display classification for automation progress lines.
//!
//! Purely cosmetic: observers use the kind to style a line. Nothing in the
//! supervisor or dispatcher branches on it.

use shared_types::StepKind;

const ERROR_MARKERS: &[&str] = &["错误", "❌", "error", "traceback", "exception"];
const ACTION_MARKERS: &[&str] = &["执行", "⚡", "action"];
const THINKING_MARKERS: &[&str] = &["思考", "🤔", "thinking"];

/// Classify one line of agent output. Error markers win over everything else
/// so a failing action is still rendered as an error.
pub fn classify_line(line: &str) -> StepKind {
    let lowered = line.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lowered.contains(m));

    if has(ERROR_MARKERS) {
        StepKind::Error
    } else if has(ACTION_MARKERS) {
        StepKind::Action
    } else if has(THINKING_MARKERS) {
        StepKind::Thinking
    } else {
        StepKind::Result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_markers() {
        assert_eq!(classify_line("🤔 思考中: 需要打开微信"), StepKind::Thinking);
        assert_eq!(classify_line("⚡ 执行动作: Tap(540, 1200)"), StepKind::Action);
        assert_eq!(classify_line("❌ 执行失败"), StepKind::Error);
        assert_eq!(classify_line("Traceback (most recent call last):"), StepKind::Error);
        assert_eq!(classify_line("screenshot captured"), StepKind::Result);
    }
}
