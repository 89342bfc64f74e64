//! Fixed instructions and prompt templates for the two completion steps.

/// Stands in for the snippet block when search produced nothing.
pub const NO_SNIPPETS_PLACEHOLDER: &str = "(Nessun snippet disponibile.)";

pub const SYSTEM_IT: &str = "Sei un assistente che scrive descrizioni di corsi di laurea per futuri studenti.
Usa SOLO le informazioni presenti nel testo fornito. Non inventare dati su occupazione, programmi o numeri.
Scrivi in italiano, in 2-3 paragrafi: cosa si studia, quali competenze si acquisiscono, quali sbocchi professionali sono plausibili.
Output: solo il testo della descrizione, senza titoli o prefissi.";

pub const SYSTEM_EN: &str = "You are an assistant that translates Italian degree descriptions into English for prospective students.
Keep the same tone, length, and structure. Do not add or remove factual claims. Output only the translated text, no headings or prefixes.";

/// Snippets separated by blank lines, or the placeholder.
pub fn snippet_block(snippets: &[String]) -> String {
    if snippets.is_empty() {
        NO_SNIPPETS_PLACEHOLDER.to_string()
    } else {
        snippets.join("\n\n")
    }
}

pub fn italian_prompt(name_it: &str, name_en: &str, snippets: &str) -> String {
    format!(
        "Corso di laurea: {name_it} ({name_en}).
Testo ufficiale (snippet da sito universitario):
---
{snippets}
---
Scrivi la descrizione in italiano come indicato nelle istruzioni di sistema."
    )
}

pub fn translation_prompt(description_it: &str) -> String {
    format!(
        "Translate the following Italian degree description to English. Output only the English text.

---
{description_it}
---"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_block_joins_with_blank_lines() {
        let block = snippet_block(&["uno".to_string(), "due".to_string()]);
        assert_eq!(block, "uno\n\ndue");
        assert_eq!(snippet_block(&[]), NO_SNIPPETS_PLACEHOLDER);
    }

    #[test]
    fn italian_prompt_embeds_names_and_snippets() {
        let prompt = italian_prompt("Fisica", "Physics", "testo");
        assert!(prompt.starts_with("Corso di laurea: Fisica (Physics)."));
        assert!(prompt.contains("---\ntesto\n---"));
    }
}
