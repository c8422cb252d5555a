//! NPC subsystem tests: sentence accumulation and the dynamic-texture
//! script declaration parser.

#[cfg(test)]
mod tests {
    use cyberspace_world::dyntex::{parse_dyn_tex_decl, DynTexTarget};
    use cyberspace_world::npc::SentenceAccumulator;

    // -----------------------------------------------------------------------
    // Sentence accumulation
    // -----------------------------------------------------------------------

    #[test]
    fn complete_sentences_flush_incomplete_tail_stays() {
        let mut acc = SentenceAccumulator::default();
        acc.push("Hello there. How are");

        let sentences = acc.take_complete_sentences();
        assert_eq!(sentences, vec!["Hello there.".to_string()]);
        assert!(!acc.is_empty(), "unterminated tail stays buffered");

        acc.push(" you?");
        let sentences = acc.take_complete_sentences();
        assert_eq!(sentences, vec![" How are you?".to_string()]);
        assert!(acc.is_empty());
    }

    #[test]
    fn multiple_sentences_flush_in_order() {
        let mut acc = SentenceAccumulator::default();
        acc.push("One. Two! Three?");
        let sentences = acc.take_complete_sentences();
        assert_eq!(
            sentences,
            vec!["One.".to_string(), " Two!".to_string(), " Three?".to_string()]
        );
    }

    #[test]
    fn newlines_terminate_sentences() {
        let mut acc = SentenceAccumulator::default();
        acc.push("line one\nline two");
        let sentences = acc.take_complete_sentences();
        assert_eq!(sentences, vec!["line one\n".to_string()]);
        assert_eq!(acc.take_rest(), Some("line two".to_string()));
        assert!(acc.is_empty());
    }

    #[test]
    fn take_rest_discards_pure_whitespace() {
        let mut acc = SentenceAccumulator::default();
        acc.push("   ");
        assert_eq!(acc.take_rest(), None);
        assert!(acc.is_empty());
    }

    #[test]
    fn no_flush_without_terminator() {
        let mut acc = SentenceAccumulator::default();
        acc.push("still typing");
        assert!(acc.take_complete_sentences().is_empty());
        assert!(!acc.is_empty());
    }

    // -----------------------------------------------------------------------
    // Dynamic-texture declarations
    // -----------------------------------------------------------------------

    #[test]
    fn parses_well_formed_declaration() {
        let script = r#"some preamble
<dynamic_texture_update base_url="https://example.com/cam.jpg" material_index="1" material_texture="colour"/>
"#;
        let decl = parse_dyn_tex_decl(script).unwrap();
        assert_eq!(decl.base_url, "https://example.com/cam.jpg");
        assert_eq!(decl.material_index, 1);
        assert_eq!(decl.material_texture, DynTexTarget::Colour);
    }

    #[test]
    fn parses_emission_target() {
        let script = r#"<dynamic_texture_update base_url="http://x/y.png" material_index="0" material_texture="emission"/>"#;
        let decl = parse_dyn_tex_decl(script).unwrap();
        assert_eq!(decl.material_texture, DynTexTarget::Emission);
    }

    #[test]
    fn rejects_malformed_declarations() {
        assert!(parse_dyn_tex_decl("no declaration here").is_none());
        // Missing attribute.
        assert!(parse_dyn_tex_decl(
            r#"<dynamic_texture_update base_url="http://x" material_texture="colour"/>"#
        )
        .is_none());
        // Non-HTTP URL.
        assert!(parse_dyn_tex_decl(
            r#"<dynamic_texture_update base_url="file:///etc/passwd" material_index="0" material_texture="colour"/>"#
        )
        .is_none());
        // Unknown target.
        assert!(parse_dyn_tex_decl(
            r#"<dynamic_texture_update base_url="http://x" material_index="0" material_texture="normal"/>"#
        )
        .is_none());
    }
}
