//! Character-based token accounting.
//!
//! Input is priced at one token per four characters and output at one token
//! per three, scaled by the model multiplier plus a fixed 5% overhead.

const INPUT_CHARS_PER_TOKEN: f64 = 4.0;
const OUTPUT_CHARS_PER_TOKEN: f64 = 3.0;
const OVERHEAD: f64 = 1.05;

pub fn cost(input_chars: usize, output_chars: usize, multiplier: f64) -> f64 {
    let input = input_chars as f64 / INPUT_CHARS_PER_TOKEN;
    let output = output_chars as f64 / OUTPUT_CHARS_PER_TOKEN;
    (input + output) * multiplier * OVERHEAD
}

/// Whole-token amount debited from a balance.
pub fn billable(cost: f64) -> i64 {
    if !cost.is_finite() || cost <= 0.0 {
        return 0;
    }
    cost.round() as i64
}

/// Approximate token counts reported back in the `usage` block.
pub fn usage_tokens(input_chars: usize, output_chars: usize) -> (u64, u64) {
    let prompt = (input_chars as f64 / INPUT_CHARS_PER_TOKEN).ceil() as u64;
    let completion = (output_chars as f64 / OUTPUT_CHARS_PER_TOKEN).ceil() as u64;
    (prompt, completion)
}
