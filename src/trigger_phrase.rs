struct PrefixRule {
    /// Caption must start with this for the rule to apply.
    starts_with: &'static str,
    /// Text replaced (every occurrence) by `{style}` + `suffix`.
    replace: &'static str,
    suffix: &'static str,
    /// Extra literal substitution applied after the main one.
    extra: Option<(&'static str, &'static str)>,
}

const PREFIX_RULES: &[PrefixRule] = &[
    PrefixRule {
        starts_with: "The image shows",
        replace: "The image shows",
        suffix: " that shows",
        extra: None,
    },
    PrefixRule {
        starts_with: "The image is an aerial view",
        replace: "The image is",
        suffix: " of",
        extra: None,
    },
    PrefixRule {
        starts_with: "The image is a close-up",
        replace: "The image is",
        suffix: " of",
        extra: None,
    },
    PrefixRule {
        starts_with: "The image is a macro",
        replace: "The image is",
        suffix: " of",
        extra: None,
    },
    PrefixRule {
        starts_with: "The image is a panorama",
        replace: "The image is",
        suffix: " of",
        extra: None,
    },
    PrefixRule {
        starts_with: "The image is a wide-angle",
        replace: "The image is",
        suffix: " of",
        extra: None,
    },
    PrefixRule {
        starts_with: "The image is a landscape",
        replace: "The image is",
        suffix: " of",
        extra: Some(("landscape painting", "landscape")),
    },
];

/// Instruction appended to the prompt for backends that follow instructions.
pub fn instruction_with_trigger(prompt: &str, trigger_phrase: Option<&str>) -> String {
    match trigger_phrase.map(str::trim).filter(|phrase| !phrase.is_empty()) {
        Some(phrase) => format!(
            "{prompt} Start the description with the following phrase: '{phrase} style image of'"
        ),
        None => prompt.to_string(),
    }
}

/// Rewrites `caption` so it opens with "A {trigger} style image".
///
/// Without a matching rule, the first sentence is replaced: from its
/// " of " onwards the original wording is kept, otherwise the whole first
/// sentence becomes "A {trigger} style image.". Every path except that
/// last one also turns "illustration" into "image".
pub fn rewrite_with_trigger_phrase(caption: &str, trigger_phrase: &str) -> String {
    let style = format!("A {trigger_phrase} style image");

    if let Some(rule) = PREFIX_RULES
        .iter()
        .find(|rule| caption.starts_with(rule.starts_with))
    {
        let mut rewritten = caption.replace(rule.replace, &format!("{style}{}", rule.suffix));
        if let Some((from, to)) = rule.extra {
            rewritten = rewritten.replace(from, to);
        }
        return rewritten.replace("illustration", "image");
    }

    let first_sentence = first_sentence(caption);
    match first_sentence.find(" of ") {
        None => caption.replace(first_sentence, &format!("{style}.")),
        Some(of_index) => {
            let of_clause = &first_sentence[of_index..];
            let tail = caption
                .find(of_clause)
                .map(|index| &caption[index..])
                .unwrap_or(of_clause);
            format!("{style}{tail}").replace("illustration", "image")
        }
    }
}

/// Text up to and including the first `.`, `!` or `?`, trimmed.
///
/// A caption without sentence punctuation is treated as one sentence.
fn first_sentence(text: &str) -> &str {
    text.find(['.', '!', '?'])
        .map(|end| &text[..=end])
        .unwrap_or(text)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_image_shows_prefix() {
        let caption = "The image shows a cat on a sofa. The illustration is colorful.";
        assert_eq!(
            rewrite_with_trigger_phrase(caption, "ghibli"),
            "A ghibli style image that shows a cat on a sofa. The image is colorful."
        );
    }

    #[test]
    fn rewrites_close_up_prefix_everywhere() {
        let caption = "The image is a close-up of a flower. The image is bright.";
        assert_eq!(
            rewrite_with_trigger_phrase(caption, "macro"),
            "A macro style image of a close-up of a flower. A macro style image of bright."
        );
    }

    #[test]
    fn landscape_rule_also_drops_painting() {
        let caption = "The image is a landscape painting of hills.";
        assert_eq!(
            rewrite_with_trigger_phrase(caption, "oil"),
            "A oil style image of a landscape of hills."
        );
    }

    #[test]
    fn fallback_splices_from_of_clause() {
        let caption = "A digital illustration of a knight in armor. He holds a sword.";
        assert_eq!(
            rewrite_with_trigger_phrase(caption, "pixel"),
            "A pixel style image of a knight in armor. He holds a sword."
        );
    }

    #[test]
    fn fallback_without_of_replaces_first_sentence_and_keeps_illustration() {
        let caption = "Two dogs play in the snow. An illustration hangs behind them.";
        assert_eq!(
            rewrite_with_trigger_phrase(caption, "sketch"),
            "A sketch style image. An illustration hangs behind them."
        );
    }

    #[test]
    fn caption_without_punctuation_is_one_sentence() {
        assert_eq!(
            rewrite_with_trigger_phrase("a red car parked outside", "retro"),
            "A retro style image."
        );
    }

    #[test]
    fn instruction_appends_trigger_request() {
        assert_eq!(
            instruction_with_trigger("Describe this image.", Some("anime")),
            "Describe this image. Start the description with the following phrase: 'anime style image of'"
        );
        assert_eq!(
            instruction_with_trigger("Describe this image.", Some("  ")),
            "Describe this image."
        );
        assert_eq!(instruction_with_trigger("Describe.", None), "Describe.");
    }
}
