use serde_json::json;

use crate::llm::models::ToolSpec;

pub const RUN_QUERY_TOOL: &str = "run_query";

const FEW_SHOT_EXAMPLES: &str = r#"Question: How many orders are above 100?
SQL: SELECT COUNT(*) AS total FROM orders WHERE amount > 100;

Question: Which 5 customers placed the most orders?
SQL: SELECT c.name, COUNT(o.id) AS order_count FROM customers c JOIN orders o ON c.id = o.customer_id GROUP BY c.name ORDER BY order_count DESC LIMIT 5;

Question: Revenue per product category, highest first.
SQL: SELECT cat.name, SUM(oi.price * oi.quantity) AS revenue FROM categories cat JOIN products p ON cat.id = p.category_id JOIN order_items oi ON p.id = oi.product_id GROUP BY cat.name ORDER BY revenue DESC;

Question: Rank sales reps by total sales.
SQL: SELECT rep, SUM(sales) AS total_sales, RANK() OVER (ORDER BY SUM(sales) DESC) AS sales_rank FROM sales GROUP BY rep;"#;

/// The single tool the SQL agent may call.
pub fn run_query_tool() -> ToolSpec {
    ToolSpec {
        name: RUN_QUERY_TOOL.to_string(),
        description: "Execute a read-only SQL query against the database and return the rows as JSON."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "sql": {
                    "type": "string",
                    "description": "A single SELECT or WITH statement"
                }
            },
            "required": ["sql"]
        }),
    }
}

pub fn sql_agent_system_prompt(dialect: &str, top_k: usize, schema: &str) -> String {
    format!(
        r#"You answer questions about a {dialect} database by writing SQL and calling the `run_query` tool.

Rules:
- Write exactly one syntactically correct {dialect} SELECT (or WITH) statement per tool call.
- Unless the question asks for a specific number of rows, LIMIT results to at most {top_k}.
- Select only the columns needed to answer; never SELECT * from a wide table.
- Use the exact table and column names from the schema below.
- Never write INSERT, UPDATE, DELETE, DROP or any other statement that changes data.
- If the tool reports an error or a warning, fix the query and call the tool again.
- Once you have the rows you need, reply with a short natural-language answer and no tool call.
- If the question has nothing to do with this database, answer "I don't know".

### Schema ({dialect}):
{schema}

### Examples:
{FEW_SHOT_EXAMPLES}"#
    )
}

pub fn classifier_prompt(question: &str, tables: &str) -> String {
    format!(
        r#"Decide whether the question below is "simple" or "analytical".

simple: one query answers it. Counts, lookups, lists, a single aggregation, a top-N.
analytical: needs several queries. Comparisons across groups, trends over time, breakdowns along
several dimensions, explanations ("why"), correlations or recommendations.

If unsure, choose "simple".

Reply with JSON only: {{"query_type": "simple" | "analytical", "reasoning": "<one sentence>"}}

Available tables: {tables}

Question: {question}"#
    )
}

pub fn planner_prompt(question: &str, schema: &str, max_steps: usize) -> String {
    format!(
        r#"Plan a multi-step SQL analysis that answers the question below.

Each step is answered by exactly one SELECT query. Order the steps from basic data gathering
to deeper analysis, covering different dimensions (time, category, segment) when useful.
Use at most {max_steps} steps.

Reply with JSON only:
{{"steps": [{{"description": "...", "sql_hint": "...", "purpose": "..."}}], "synthesis_guidance": "..."}}

### Schema:
{schema}

Question: {question}"#
    )
}

pub fn step_sql_prompt(
    dialect: &str,
    description: &str,
    sql_hint: &str,
    schema: &str,
    previous_results: &str,
) -> String {
    format!(
        r#"Write one {dialect} SELECT query for this analysis step.

Step: {description}
Hint: {sql_hint}

### Schema:
{schema}

{previous_results}

Return only the SQL, inside a ```sql code block. Aggregate, group and order as needed and add a
LIMIT when the result could be large."#
    )
}

pub fn analyst_prompt(question: &str, results: &str, guidance: &str, feedback: &str) -> String {
    let guidance = if guidance.is_empty() {
        String::new()
    } else {
        format!("\nGuidance: {}\n", guidance)
    };
    let feedback = if feedback.is_empty() {
        String::new()
    } else {
        format!(
            "\nA previous draft had these problems, avoid them:\n{}\n",
            feedback
        )
    };

    format!(
        r#"Combine the results of a multi-step analysis into one answer.

Question: {question}
{guidance}
### Step results:
{results}
{feedback}
Cite concrete numbers from the results. Point out findings that connect several steps.
If a step failed, say the data for it is unavailable and do not invent numbers for it.
Finish with actionable observations. Be concise."#
    )
}

pub fn table_selection_prompt(question: &str, summaries: &str, max_tables: usize) -> String {
    format!(
        r#"Question: "{question}"

Which of these tables are needed to answer it? Reply with a JSON array of table names only
(at most {max_tables}).

{summaries}"#
    )
}
