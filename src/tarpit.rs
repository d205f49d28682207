//! Tarpit content generator — Markov-chain prose and labyrinth link mazes,
//! per SPEC_FULL.md §4.10.
//!
//! Both strategies wrap their body in the same obfuscated CSS/JS shell and
//! (optionally) a fingerprinting script, mirroring `labyrinth.py`'s use of
//! `obfuscation.py`'s helpers for both generators rather than duplicating the
//! obfuscation logic per-generator.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

/// Fallback corpus used when no corpus file is configured or it fails to
/// load — mirrors `markov_generator.py`'s own repeated-sentence fallback for
/// when its live scrape comes back empty.
const DEFAULT_CORPUS: &str = "Technical documentation often includes setup guides. \
Installation requires dependencies. Configuration files use YAML syntax. \
API endpoints follow REST principles. Authentication uses OAuth2 tokens. \
Databases store user information. Caching improves performance. \
Logging tracks application events. Monitoring checks system health. \
Deployment involves Docker containers. Version control uses Git repositories. \
Continuous integration runs automated tests. Security audits prevent vulnerabilities. \
Scalability handles increased load. Backup strategies ensure data recovery.";

/// Order-2 word-transition table: `(w1, w2) -> weighted list of followers`.
///
/// Built once at startup from a static corpus and never mutated afterward —
/// matches the upstream `markovify.Text(corpus, state_size=2)` model, rebuilt
/// in-crate instead of pulled in as an out-of-process dependency since it's a
/// pure, small computation.
pub struct MarkovModel {
    chain: HashMap<(String, String), Vec<(String, u32)>>,
    starts: Vec<(String, String)>,
}

impl MarkovModel {
    pub fn from_corpus(corpus: &str) -> Self {
        let mut chain: HashMap<(String, String), HashMap<String, u32>> = HashMap::new();
        let mut starts = Vec::new();

        for sentence in corpus.split(['.', '!', '?']) {
            let words: Vec<&str> = sentence.split_whitespace().collect();
            if words.len() < 3 {
                continue;
            }
            starts.push((words[0].to_string(), words[1].to_string()));
            for window in words.windows(3) {
                let key = (window[0].to_string(), window[1].to_string());
                *chain.entry(key).or_default().entry(window[2].to_string()).or_insert(0) += 1;
            }
        }

        let chain = chain
            .into_iter()
            .map(|(k, followers)| (k, followers.into_iter().collect()))
            .collect();

        if starts.is_empty() {
            return Self::from_corpus_fallback();
        }

        Self { chain, starts }
    }

    fn from_corpus_fallback() -> Self {
        let mut model = Self { chain: HashMap::new(), starts: Vec::new() };
        let built = Self::from_corpus(DEFAULT_CORPUS);
        model.chain = built.chain;
        model.starts = built.starts;
        model
    }

    pub fn default_model() -> Self {
        Self::from_corpus(DEFAULT_CORPUS)
    }

    /// Load the corpus from `path`, falling back to the bundled default on
    /// any read error (matches `load_robots_txt`'s permissive style; a
    /// missing corpus is a degraded feature, not a startup failure).
    pub fn load(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) if !text.trim().is_empty() => Self::from_corpus(&text),
            _ => Self::default_model(),
        }
    }

    /// Generate one Markov sentence of roughly `tries` attempts at finding a
    /// chain walk of reasonable length, mirroring `make_sentence(tries=100)`.
    pub fn make_sentence(&self, rng: &mut impl Rng, max_words: usize) -> Option<String> {
        let (mut w1, mut w2) = self.starts.choose(rng)?.clone();
        let mut words = vec![w1.clone(), w2.clone()];

        while words.len() < max_words {
            let Some(followers) = self.chain.get(&(w1.clone(), w2.clone())) else {
                break;
            };
            let total: u32 = followers.iter().map(|(_, weight)| weight).sum();
            if total == 0 {
                break;
            }
            let mut pick = rng.gen_range(0..total);
            let mut next = None;
            for (word, weight) in followers {
                if pick < *weight {
                    next = Some(word.clone());
                    break;
                }
                pick -= *weight;
            }
            let Some(next) = next else { break };
            words.push(next.clone());
            w1 = w2;
            w2 = next;
        }

        let mut sentence = words.join(" ");
        if let Some(first) = sentence.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        sentence.push('.');
        Some(sentence)
    }
}

/// Shared opening/closing `<a>` fragments so generating many links allocates
/// once per fragment instead of once per link — ports `LinkFlyweight`.
pub struct LinkFlyweight {
    opening_tag: String,
    closing_tag: &'static str,
}

impl LinkFlyweight {
    pub fn new(base_url: &str) -> Self {
        Self {
            opening_tag: format!("<a href=\"{base_url}/"),
            closing_tag: "</a><br/>",
        }
    }

    pub fn link(&self, token: &str) -> String {
        format!("{}{token}\">{token}{}", self.opening_tag, self.closing_tag)
    }
}

/// Base64-wraps a tiny CSS payload behind a `data:` URI `@import`, per
/// `generate_obfuscated_css`.
pub fn generate_obfuscated_css() -> String {
    let css = "body{background:#fff;color:#111;}\n\
               a{color:#06c;text-decoration:none;}\n\
               a:hover{text-decoration:underline;}";
    let encoded = BASE64.encode(css);
    format!("<style>@import url('data:text/css;base64,{encoded}');</style>")
}

/// Base64-wraps a trivial script behind `eval(atob(...))`, per
/// `generate_obfuscated_js`.
pub fn generate_obfuscated_js() -> String {
    let script = "(function(){console.log('loading');})();";
    let encoded = BASE64.encode(script);
    format!("<script>eval(atob('{encoded}'))</script>")
}

/// Heavier fingerprint-collection script with randomized variable names, per
/// `generate_fingerprinting_script`. Only emitted when the `fingerprinting`
/// flag is set.
pub fn generate_fingerprinting_script(rng: &mut impl Rng) -> String {
    let names: Vec<String> = (0..10)
        .map(|_| {
            (0..6)
                .map(|_| (b'a' + rng.gen_range(0..26)) as char)
                .collect::<String>()
        })
        .collect();
    let [ua, res, depth, lang, plat, tz, cores, plugins, fonts, out] = names
        .try_into()
        .unwrap_or_else(|_| unreachable!("exactly 10 names generated above"));

    let script = format!(
        "var {ua}=navigator.userAgent;\
         var {res}=screen.width+'x'+screen.height;\
         var {depth}=screen.colorDepth;\
         var {lang}=navigator.language||'';\
         var {plat}=navigator.platform||'';\
         var {tz}=new Date().getTimezoneOffset();\
         var {cores}=navigator.hardwareConcurrency||0;\
         var {plugins}=[];\
         for(var i=0;i<(navigator.plugins||[]).length;i++){{{plugins}.push(navigator.plugins[i].name);}}\
         var {fonts}=[];\
         if(document.fonts&&document.fonts.forEach){{document.fonts.forEach(function(f){{{fonts}.push(f.family);}});}}\
         var {out}=[{ua},{res},{depth},{lang},{plat},{tz},{cores},{plugins}.join(','),{fonts}.join(',')];\
         console.log('fp',{out});"
    );
    format!("<script>{script}</script>")
}

fn seed_to_u64(seed: &str) -> u64 {
    let digest = Sha256::digest(seed.as_bytes());
    u64::from_le_bytes(digest[0..8].try_into().expect("sha256 digest is at least 8 bytes"))
}

/// Markov-generated deceptive page: 7–15 paragraphs of synthesized prose, a
/// block of 5 deceptive internal links, and a hidden honeypot anchor.
pub fn generate_markov_page(model: &MarkovModel, seed: &str, fingerprinting: bool) -> String {
    let mut rng = StdRng::seed_from_u64(seed_to_u64(seed));

    let paragraph_count = rng.gen_range(7..=15);
    let mut body = String::new();
    for _ in 0..paragraph_count {
        if let Some(sentence) = model.make_sentence(&mut rng, 24) {
            body.push_str("<p>");
            body.push_str(&sentence);
            body.push_str("</p>\n");
        }
    }

    let flyweight = LinkFlyweight::new("/tarpit/page");
    let mut links = String::from("<ul>\n");
    for i in 0..5 {
        let token = &hex::encode(Sha256::digest(format!("{seed}-{i}").as_bytes()))[..8];
        links.push_str("<li>");
        links.push_str(&flyweight.link(token));
        links.push_str("</li>\n");
    }
    links.push_str("</ul>\n");

    let css = generate_obfuscated_css();
    let js = generate_obfuscated_js();
    let fp = if fingerprinting {
        generate_fingerprinting_script(&mut rng)
    } else {
        String::new()
    };

    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<title>Resource Not Found - Documentation</title>\n\
         <meta name=\"robots\" content=\"noindex, nofollow\">\n{css}\n</head>\n<body>\n\
         <h1>Internal Resource Area</h1>\n{body}<h2>Related Resources:</h2>\n{links}\n\
         <div style=\"margin-top: 50px; visibility: hidden;\">\n\
         <a href=\"/admin/login-internal-special-route\">Admin Panel</a>\n</div>\n{js}\n{fp}\n</body>\n</html>"
    )
}

/// Labyrinth page: `depth` anchors whose hrefs are truncated SHA-256 tokens
/// derived from `seed ‖ i`, shuffled so there is no positional pattern —
/// ports `generate_labyrinth_page` directly.
pub fn generate_labyrinth_page(seed: &str, depth: usize, fingerprinting: bool) -> String {
    let mut rng = StdRng::seed_from_u64(seed_to_u64(seed));

    let mut tokens: Vec<String> = (0..depth)
        .map(|i| hex::encode(Sha256::digest(format!("{seed}-{i}").as_bytes()))[..8].to_string())
        .collect();
    tokens.shuffle(&mut rng);

    let flyweight = LinkFlyweight::new("/tarpit");
    let body: String = tokens.iter().map(|token| flyweight.link(token)).collect();

    let css = generate_obfuscated_css();
    let js = generate_obfuscated_js();
    let fp = if fingerprinting {
        generate_fingerprinting_script(&mut rng)
    } else {
        String::new()
    };

    format!("<html><head><title>Loading...</title>{css}</head><body>{body}{js}{fp}</body></html>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markov_model_produces_nonempty_sentences_from_default_corpus() {
        let model = MarkovModel::default_model();
        let mut rng = StdRng::seed_from_u64(42);
        let sentence = model.make_sentence(&mut rng, 24);
        assert!(sentence.is_some());
        assert!(!sentence.unwrap().is_empty());
    }

    #[test]
    fn empty_corpus_falls_back_to_default() {
        let model = MarkovModel::from_corpus("");
        assert!(!model.starts.is_empty());
    }

    #[test]
    fn markov_page_contains_paragraphs_links_and_honeypot_anchor() {
        let model = MarkovModel::default_model();
        let page = generate_markov_page(&model, "seed-1", false);
        assert!(page.contains("<p>"));
        assert!(page.contains("/tarpit/page/"));
        assert!(page.contains("/admin/login-internal-special-route"));
        assert!(!page.contains("navigator.userAgent"));
    }

    #[test]
    fn markov_page_includes_fingerprint_script_when_enabled() {
        let model = MarkovModel::default_model();
        let page = generate_markov_page(&model, "seed-1", true);
        assert!(page.contains("navigator.userAgent"));
    }

    #[test]
    fn markov_page_is_deterministic_for_the_same_seed() {
        let model = MarkovModel::default_model();
        let a = generate_markov_page(&model, "stable-seed", false);
        let b = generate_markov_page(&model, "stable-seed", false);
        assert_eq!(a, b);
    }

    #[test]
    fn labyrinth_page_has_exactly_depth_links() {
        let page = generate_labyrinth_page("seed-2", 5, false);
        assert_eq!(page.matches("<a href=").count(), 5);
    }

    #[test]
    fn labyrinth_links_use_eight_char_hex_tokens() {
        let page = generate_labyrinth_page("seed-3", 3, false);
        for token_start in page.match_indices("/tarpit/") {
            let rest = &page[token_start.0 + "/tarpit/".len()..];
            let token: String = rest.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
            assert_eq!(token.len(), 8, "token {token:?} should be 8 hex chars");
        }
    }

    #[test]
    fn labyrinth_page_is_deterministic_for_the_same_seed() {
        let a = generate_labyrinth_page("same", 5, false);
        let b = generate_labyrinth_page("same", 5, false);
        assert_eq!(a, b);
    }

    #[test]
    fn obfuscated_css_wraps_base64_in_data_uri_import() {
        let css = generate_obfuscated_css();
        assert!(css.starts_with("<style>@import url('data:text/css;base64,"));
    }

    #[test]
    fn obfuscated_js_wraps_base64_in_eval_atob() {
        let js = generate_obfuscated_js();
        assert!(js.contains("eval(atob('"));
    }

    #[test]
    fn link_flyweight_reuses_fragments_across_calls() {
        let flyweight = LinkFlyweight::new("/tarpit");
        let a = flyweight.link("abc12345");
        let b = flyweight.link("def67890");
        assert!(a.starts_with("<a href=\"/tarpit/abc12345\">"));
        assert!(b.starts_with("<a href=\"/tarpit/def67890\">"));
    }
}
