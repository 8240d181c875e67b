//! The one prompt every strategy sends, so all judges apply the same criteria.

use std::fmt::Write as _;
use std::path::PathBuf;

use crate::rules::RuleSet;

const GUIDELINES: &str = "\
[Judgment guidelines]
1. Identify the main activity:
   - Ignore small icons, the desktop background, side advertisements and browser tabs.
   - Judge only by the active window in the centre of the screen or the largest window shown.
2. Avoid false positives:
   - A video site logo or link visible in a corner is not a violation.
   - Advertising banners on study or work pages are not violations unless the user is clearly watching them.
3. Interpret negated rules carefully:
   - For \"everything except X is prohibited\", only X is OK. Everything else is NG.
   - For \"everything except X is allowed\", only X is NG. Everything else is OK.";

const ANSWER_FORMAT: &str = "\
[Answer format]
First analyse the screen, then output the verdict.
Do not shorten the analysis; accuracy matters more than speed.
Use plain text only. Do not use Markdown (no bold, italics or headings).

[Analysis]
1. Describe the situation objectively:
   - With several images, describe each separately as (Image 1)... (Image 2)...
   - Name the window titles, running commands, chat content and settings being edited.
   - State concretely what is being used and what is being done, never just \"working\".
2. Compare against the rules:
   - Decide step by step whether the described activity is allowed or prohibited.
   - For any suspicious element (video sites, social media), reason whether it is the active window or merely visible in the background.

[Verdict]
(output exactly one of the following)
OK
Content: [what the user is doing]
(or)
NG
Reason: [the concrete violation]";

const FILE_PREAMBLE: &str = "\
[System instructions]
You are a multimodal model that can visually analyse the image data you read.
Do not conclude that you can only read text or cannot see the images. Follow these steps:
1. Use the read_file tool to read every image at the absolute paths listed at the end.
2. Recognise window titles, icons, text and the active situation in each image.
3. Judge according to the user's rules below.";

/// Rules plus guardrails and the mandated answer block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    text: String,
}

impl Prompt {
    pub fn build(rules: &RuleSet) -> Self {
        let mut text = String::new();
        text.push_str(
            "You are a strict assistant that watches the user's screen and manages their productivity.\n",
        );
        text.push_str("Judge strictly according to the user's rules and the judgment guidelines below.\n\n");
        let _ = writeln!(text, "[User rules]\n{}\n", rules.text().trim());
        text.push_str(GUIDELINES);
        text.push_str("\n\n");
        text.push_str(ANSWER_FORMAT);
        text.push('\n');
        Self { text }
    }

    /// Prompt for judges that inline the images themselves.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Prompt for judges that read the images from disk with a tool.
    pub fn with_files(&self, images: &[PathBuf]) -> String {
        let mut text = String::with_capacity(self.text.len() + 512);
        text.push_str(FILE_PREAMBLE);
        text.push_str("\n\n");
        text.push_str(self.text.trim());
        text.push_str("\n\n[Images]\n");
        for image in images {
            let _ = writeln!(text, "\"{}\"", image.display());
        }
        text
    }
}
