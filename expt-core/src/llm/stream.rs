use super::{Message, Role, ToolCall};

/// Folds streamed chunks into one message.
///
/// Text and reasoning are concatenated. A tool-call chunk with an id extends the call with
/// that id (or opens a new one); a chunk without an id extends the most recent call. Usage is
/// taken from the last chunk that carries it. Merging a prefix first and then the remaining
/// chunks gives the same message as merging the whole stream.
pub fn merge_stream_msgs(chunks: impl IntoIterator<Item = Message>) -> Option<Message> {
    let mut chunks = chunks.into_iter();
    let mut merged = chunks.next()?;
    for chunk in chunks {
        absorb(&mut merged, chunk);
    }
    Some(merged)
}

fn absorb(merged: &mut Message, chunk: Message) {
    let Message {
        role,
        content,
        reasoning_content,
        tool_calls,
        usage,
    } = chunk;

    if merged.role == Role::Unknown {
        merged.role = role;
    }
    merged.content.push_str(&content);
    merged.reasoning_content.push_str(&reasoning_content);
    for call in tool_calls {
        absorb_tool_call(&mut merged.tool_calls, call);
    }
    if usage.is_some() {
        merged.usage = usage;
    }
}

fn absorb_tool_call(calls: &mut Vec<ToolCall>, call: ToolCall) {
    let existing = if call.id.is_empty() {
        calls.last_mut()
    } else {
        calls.iter_mut().find(|existing| existing.id == call.id)
    };
    match existing {
        Some(existing) => {
            if existing.call_type.is_empty() {
                existing.call_type = call.call_type;
            }
            existing.function.name.push_str(&call.function.name);
            existing.function.arguments.push_str(&call.function.arguments);
        }
        None => calls.push(call),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{FunctionCall, TokenUsage};

    fn tool_chunk(id: &str, args: &str) -> Message {
        Message {
            tool_calls: vec![ToolCall {
                id: id.to_string(),
                call_type: String::new(),
                function: FunctionCall {
                    name: String::new(),
                    arguments: args.to_string(),
                },
            }],
            ..Default::default()
        }
    }

    fn stream() -> Vec<Message> {
        vec![
            Message {
                role: Role::Assistant,
                content: "你".to_string(),
                ..Default::default()
            },
            Message {
                content: "好".to_string(),
                usage: Some(TokenUsage {
                    input_tokens: 100,
                    output_tokens: 10,
                    total_tokens: 110,
                }),
                ..Default::default()
            },
            tool_chunk("t1", "arg1"),
            tool_chunk("", "arg2"),
        ]
    }

    #[test]
    fn test_merge_stream() {
        let merged = merge_stream_msgs(stream()).unwrap();
        assert_eq!(merged.role, Role::Assistant);
        assert_eq!(merged.content, "你好");
        assert_eq!(merged.tool_calls.len(), 1);
        assert_eq!(merged.tool_calls[0].id, "t1");
        assert_eq!(merged.tool_calls[0].function.arguments, "arg1arg2");
        assert_eq!(
            merged.usage,
            Some(TokenUsage {
                input_tokens: 100,
                output_tokens: 10,
                total_tokens: 110,
            })
        );
    }

    #[test]
    fn test_merge_is_associative_over_splits() {
        let chunks = stream();
        let whole = merge_stream_msgs(chunks.clone()).unwrap();
        for split in 1..chunks.len() {
            let prefix = merge_stream_msgs(chunks[..split].to_vec()).unwrap();
            let rest = std::iter::once(prefix).chain(chunks[split..].iter().cloned());
            assert_eq!(merge_stream_msgs(rest).unwrap(), whole, "split at {split}");
        }
    }

    #[test]
    fn test_interleaved_tool_calls_and_empty_stream() {
        let merged = merge_stream_msgs(vec![
            tool_chunk("a", "{\"x\":"),
            tool_chunk("b", "{\"y\":"),
            tool_chunk("a", "1}"),
            tool_chunk("", "2}"),
        ])
        .unwrap();
        assert_eq!(merged.tool_calls.len(), 2);
        assert_eq!(merged.tool_calls[0].function.arguments, "{\"x\":1}");
        assert_eq!(merged.tool_calls[1].function.arguments, "{\"y\":2}");
        assert!(merged.usage.is_none());

        assert!(merge_stream_msgs(Vec::new()).is_none());
    }
}
