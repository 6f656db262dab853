/// Running assistant text and reasoning text for one run. Only ever grows.
#[derive(Debug, Default)]
pub struct DeltaAccumulator {
    content: String,
    reasoning: String,
}

impl DeltaAccumulator {
    /// Appends and returns the accumulated content.
    pub fn push_content(&mut self, delta: &str) -> &str {
        self.content.push_str(delta);
        &self.content
    }

    pub fn push_reasoning(&mut self, delta: &str) -> &str {
        self.reasoning.push_str(delta);
        &self.reasoning
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulated_values_are_prefix_monotonic() {
        let mut acc = DeltaAccumulator::default();
        let mut previous = String::new();
        for delta in ["Hel", "lo", ", ", "world"] {
            let current = acc.push_content(delta).to_string();
            assert!(current.starts_with(&previous));
            assert!(current.ends_with(delta));
            previous = current;
        }
        assert_eq!(acc.content(), "Hello, world");
        assert_eq!(acc.push_reasoning("hmm"), "hmm");
        assert_eq!(acc.reasoning(), "hmm");
    }
}
