use proptest::prelude::*;
use proptest::string::string_regex;
use shrun_parser::lexer::{tokenize, TokenKind};

proptest! {
    #[test]
    fn prop_tokenize_never_panics(s in string_regex(r"(?s)[^\x00]{0,256}").unwrap()) {
        let _ = tokenize(&s);
    }

    #[test]
    fn prop_plain_words_survive(words in prop::collection::vec("[a-z0-9_./-]{1,12}", 1..8)) {
        let line = words.join(" ");
        let tokens: Vec<_> = tokenize(&line)
            .into_iter()
            .filter_map(|t| match t.kind {
                TokenKind::Word(w) => Some(w),
                _ => None,
            })
            .collect();
        prop_assert_eq!(tokens, words);
    }

    #[test]
    fn prop_parse_string_never_panics(s in string_regex(r"[a-z =|&;<>\n'\x22(){}$]{0,128}").unwrap()) {
        let _ = shrun_parser::parse(&s);
    }
}
