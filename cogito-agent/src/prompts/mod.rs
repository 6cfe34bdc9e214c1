use crate::clients::ToolDefinition;
use crate::executor::ToolOutcome;

/// System framing injected at chain start: the think/act/observe protocol
/// plus the advertised tool list.
pub fn build_system_prompt(tools: &[ToolDefinition]) -> String {
    let tools_section = if tools.is_empty() {
        "You have no tools available; answer from your own knowledge.".to_string()
    } else {
        let lines: Vec<String> = tools
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect();
        format!("Available tools:\n{}", lines.join("\n"))
    };

    format!(
        r#"You are a helpful AI assistant that can use tools to accomplish tasks.

{tools_section}

When solving a problem, follow the ReAct (Reasoning and Acting) pattern:
1. Thought: think about what you need to do next
2. Action: choose a tool and specify its arguments
3. Observation: analyze the tool's result
4. Repeat until you can answer the question

When you have gathered enough information, reply with your conclusion on a
line starting with "Final Answer:".

Be systematic. Break complex problems into smaller steps."#
    )
}

/// Formats a tool outcome as the tool-role message the model sees on its
/// next turn. Failures are surfaced verbatim so the model can adapt.
pub fn format_tool_outcome(outcome: &ToolOutcome) -> String {
    if outcome.success {
        let output = outcome
            .output
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default();
        format!(
            "Tool '{}' executed successfully.\nResult: {}",
            outcome.tool_name, output
        )
    } else {
        let reason = outcome
            .failure
            .as_ref()
            .map(|f| f.to_string())
            .unwrap_or_else(|| "unknown failure".to_string());
        format!("Tool '{}' failed.\nError: {}", outcome.tool_name, reason)
    }
}

/// Extracts a final answer from backend text: the remainder after the first
/// matching stop phrase, compared ASCII-case-insensitively, with leading
/// separator punctuation stripped.
pub fn extract_final_answer(text: &str, stop_phrases: &[String]) -> Option<String> {
    for phrase in stop_phrases {
        if phrase.is_empty() {
            continue;
        }
        if let Some(pos) = find_ignore_ascii_case(text, phrase) {
            let mut answer = text[pos + phrase.len()..].trim();
            for prefix in ["-", ":", "—"] {
                if let Some(rest) = answer.strip_prefix(prefix) {
                    answer = rest.trim();
                }
            }
            return Some(answer.to_string());
        }
    }
    None
}

fn find_ignore_ascii_case(haystack: &str, needle: &str) -> Option<usize> {
    let haystack = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .find(|&i| haystack[i..i + needle.len()].eq_ignore_ascii_case(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ToolFailure;
    use rstest::rstest;
    use std::time::Duration;

    fn phrases() -> Vec<String> {
        vec!["Final Answer:".to_string(), "FINAL ANSWER:".to_string()]
    }

    #[test]
    fn system_prompt_lists_tools() {
        let tools = vec![ToolDefinition {
            name: "calculator".to_string(),
            description: "Evaluate a mathematical expression".to_string(),
            parameters: serde_json::json!({}),
        }];

        let prompt = build_system_prompt(&tools);
        assert!(prompt.contains("- calculator:"));
        assert!(prompt.contains("Final Answer:"));
    }

    #[test]
    fn system_prompt_without_tools() {
        let prompt = build_system_prompt(&[]);
        assert!(prompt.contains("no tools available"));
    }

    #[rstest]
    #[case("I am done. Final Answer: 144", Some("144"))]
    #[case("final answer: forty-two", Some("forty-two"))]
    #[case("Final Answer: - 12", Some("12"))]
    #[case("Still thinking about it", None)]
    #[case("", None)]
    fn final_answer_extraction(#[case] text: &str, #[case] expected: Option<&str>) {
        assert_eq!(
            extract_final_answer(text, &phrases()).as_deref(),
            expected
        );
    }

    #[test]
    fn formats_success_and_failure() {
        let ok = ToolOutcome {
            call_id: "c1".to_string(),
            tool_name: "calculator".to_string(),
            success: true,
            output: Some(serde_json::json!({"result": "144"})),
            failure: None,
            elapsed: Duration::from_millis(2),
        };
        let formatted = format_tool_outcome(&ok);
        assert!(formatted.contains("executed successfully"));
        assert!(formatted.contains("144"));

        let failed = ToolOutcome {
            call_id: "c2".to_string(),
            tool_name: "sleep".to_string(),
            success: false,
            output: None,
            failure: Some(ToolFailure::Timeout { deadline_ms: 20 }),
            elapsed: Duration::from_millis(20),
        };
        let formatted = format_tool_outcome(&failed);
        assert!(formatted.contains("failed"));
        assert!(formatted.contains("20ms"));
    }
}
