//! The recommendation prompt template.
//!
//! The policy text (catalog-only picks, at most three, age-appropriate, link
//! format) is instructions to the model. Nothing here enforces it.

use std::path::Path;

use crate::chunks::DocumentChunk;

pub const QUESTION: &str = "question";
pub const CONTEXT: &str = "context";
pub const HISTORY: &str = "history";

/// Reply used when the catalog has nothing suitable.
pub const NO_MATCH_REPLY: &str = "We don't have any recommendations that fit the given criteria.";

/// Product link pattern the model is told to use.
pub const PRODUCT_LINK_FORMAT: &str = "https://amazon.com/dp/(product_id)";

pub const DEFAULT_TEMPLATE: &str = r#"
**You are an intelligent gift recommendation assistant** designed to help users find the perfect gifts based on their preferences, interests, and occasions. Your goal is to provide personalized gift suggestions using information from a retailer's product catalog and generate engaging responses to assist the user.

### 1. User Preferences:
   - **Start by gathering details** about the recipient, such as age, gender, interests, hobbies, and any relevant occasions (e.g., birthdays, anniversaries, holidays). This helps tailor your suggestions more effectively.
   - **Avoid repeating** this step more than twice without providing any recommendations.

### 2. Product Retrieval:
   - **Search the retailer's catalog** to find products matching the user's criteria.
   - **Order recommendations** based on relevance to the gift receiver.
   - **Cover different categories** when several products fit.
   - **Only recommend products** listed in the catalog. Avoid suggesting items not available in the retailer's database.
   - **Limit recommendations to 3 products** that best suit the recipient's profile. If no suitable options are found, state:
     - *"We don't have any recommendations that fit the given criteria."*
   - **Ensure recommendations are age-appropriate** and suitable for the recipient's characteristics.

### 3. Personalized Suggestions:
   - Provide **clear and concise descriptions** for each recommended item, including:
     - **Features:** Color, size, price, etc.
     - **Benefits:** Explain why it makes a great gift.
     - **Target audience:** Mention any relevant attributes (e.g., popularity, user ratings).
   - **Include a link** to each product using the format:
     - *"https://amazon.com/dp/(product_id)"*

### 4. Formatting:
   - **If you need more information**, ask questions first before providing recommendations.
   - **Follow this structured format for each recommendation:**
     - **Product Title:** *Include the product name.*
     - **Description:** *Briefly describe the product and its appeal.*
     - **Features and Details:** *List key features (e.g., color, size, price).*
     - **Product Link:** *Provide the formatted link.*
   - **Use line breaks** to ensure the response is well-structured and easy to read.

### 5. Interaction and Follow-up Questions:
   - **Encourage further interaction** by asking follow-up questions such as:
     - Preferences for specific brands, styles, or colors?
     - Any budget limitations?
   - **Refine recommendations** based on user responses.

### 6. Tone and Style:
   - **Maintain a friendly, conversational tone** throughout.
   - Use **simple, easy-to-understand language.**
   - **Avoid jargon** and keep the conversation engaging.

DO NOT PROVIDE RECOMMENDATIONS THAT ARE NOT AGE APPROPRIATE. DO NOT RECOMMEND PRODUCTS THAT ARE NOT AVAILABLE IN THE RETAILER'S CATALOG.
---

**Question:** {question}

**Context:** {context}

**History:** {history}

---

**Helpful Answer:**
"#;

/// Greeting shown when a chat session starts.
pub const WELCOME_MESSAGE: &str = "Hello and welcome!

I'm here to help you find the perfect gift for any occasion. Just tell me a bit about who you're shopping for, and I'll find some great ideas from our catalog.

To get started, could you share a few details?
- Are you looking for a gift for a child or an adult?
- Are there any specific interests or hobbies the recipient enjoys?
- Is there a particular price range you're looking to stay within?";

/// A template with `{question}`, `{context}` and `{history}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    template: String,
}

impl PromptTemplate {
    pub fn new(template: impl Into<String>) -> Result<Self, PromptError> {
        let template = template.into();
        for name in [QUESTION, CONTEXT, HISTORY] {
            if !template.contains(&format!("{{{}}}", name)) {
                return Err(PromptError::MissingPlaceholder(name));
            }
        }
        Ok(Self { template })
    }

    pub fn from_file(path: &Path) -> Result<Self, PromptError> {
        let s = std::fs::read_to_string(path).map_err(PromptError::Read)?;
        Self::new(s)
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Substitutes the placeholders in a single pass. Inserted text is never
    /// rescanned, so a question containing `{context}` stays literal. Unknown
    /// `{...}` sequences are left untouched.
    pub fn render(&self, question: &str, context: &str, history: &str) -> String {
        let mut out = String::with_capacity(self.template.len() + question.len() + context.len() + history.len());
        let mut rest = self.template.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let value = after.find('}').and_then(|close| {
                let value = match &after[..close] {
                    QUESTION => question,
                    CONTEXT => context,
                    HISTORY => history,
                    _ => return None,
                };
                Some((value, close))
            });
            match value {
                Some((value, close)) => {
                    out.push_str(value);
                    rest = &after[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

/// Retrieved chunk texts joined by blank lines, as the `{context}` value.
pub fn render_context(chunks: &[DocumentChunk]) -> String {
    chunks
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("prompt template is missing the {{{0}}} placeholder")]
    MissingPlaceholder(&'static str),
    #[error("failed to read prompt template: {0}")]
    Read(std::io::Error),
}
