//! Coarse transaction type classification from instructions and log messages.
//!
//! Rules are evaluated in order and the first match wins. Instruction matchers look at
//! the primary instruction: the first one not addressed to the ComputeBudget program.
//! The rule set is data, so deployments can replace it from configuration.

use serde::{Deserialize, Serialize};

pub const COMPUTE_BUDGET_PROGRAM: &str = "ComputeBudget111111111111111111111111111111";
pub const VOTE_PROGRAM: &str = "Vote111111111111111111111111111111111111111";
pub const SYSTEM_PROGRAM: &str = "11111111111111111111111111111111";
pub const BPF_UPGRADEABLE_LOADER: &str = "BPFLoaderUpgradeab1e11111111111111111111111";
pub const ADDRESS_LOOKUP_TABLE_PROGRAM: &str = "AddressLookupTab1e1111111111111111111111111";
pub const PYTH_ORACLE_PROGRAM: &str = "FsJ3A3u2vn5cTVofAjvy6y5kwABJAqYWpe4975bi2epH";

pub const TYPE_COMPUTE_BUDGET: &str = "compute-budget";
pub const TYPE_PROGRAM_CALL: &str = "program-call";
pub const TYPE_UNKNOWN: &str = "unknown";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", content = "value", rename_all = "snake_case")]
pub enum Matcher {
    /// Primary instruction's program id.
    ProgramId(String),
    /// Primary instruction's parsed program name (`system`, `spl-token`, `vote`, ...).
    Program(String),
    /// Primary instruction's parsed type (`transfer`, `mintTo`, ...).
    InstructionType(String),
    LogEquals(String),
    LogPrefix(String),
    LogContains(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierRule {
    #[serde(flatten)]
    pub matcher: Matcher,
    pub tx_type: String,
}

impl ClassifierRule {
    pub fn new(matcher: Matcher, tx_type: &str) -> Self {
        Self {
            matcher,
            tx_type: tx_type.to_string(),
        }
    }
}

/// What the classifier needs to know about one instruction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstructionFacts {
    pub program_id: Option<String>,
    pub program: Option<String>,
    pub kind: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct TxFacts {
    pub instructions: Vec<InstructionFacts>,
    pub logs: Vec<String>,
}

impl TxFacts {
    fn primary(&self) -> Option<&InstructionFacts> {
        self.instructions
            .iter()
            .find(|ix| ix.program_id.as_deref() != Some(COMPUTE_BUDGET_PROGRAM))
    }
}

#[derive(Clone, Debug)]
pub struct Classifier {
    rules: Vec<ClassifierRule>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl Classifier {
    pub fn new(rules: Vec<ClassifierRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[ClassifierRule] {
        &self.rules
    }

    pub fn classify(&self, facts: &TxFacts) -> String {
        let primary = facts.primary();
        if primary.is_none() && !facts.instructions.is_empty() {
            return TYPE_COMPUTE_BUDGET.to_string();
        }
        for rule in &self.rules {
            if matches(&rule.matcher, primary, &facts.logs) {
                return rule.tx_type.clone();
            }
        }
        if primary.is_some() {
            TYPE_PROGRAM_CALL.to_string()
        } else {
            TYPE_UNKNOWN.to_string()
        }
    }
}

fn matches(matcher: &Matcher, primary: Option<&InstructionFacts>, logs: &[String]) -> bool {
    match matcher {
        Matcher::ProgramId(id) => {
            primary.and_then(|ix| ix.program_id.as_deref()) == Some(id.as_str())
        }
        Matcher::Program(name) => {
            primary.and_then(|ix| ix.program.as_deref()) == Some(name.as_str())
        }
        Matcher::InstructionType(kind) => {
            primary.and_then(|ix| ix.kind.as_deref()) == Some(kind.as_str())
        }
        Matcher::LogEquals(line) => logs.iter().any(|l| l == line),
        Matcher::LogPrefix(prefix) => logs.iter().any(|l| l.starts_with(prefix.as_str())),
        Matcher::LogContains(needle) => logs.iter().any(|l| l.contains(needle.as_str())),
    }
}

/// Built-in rules, most specific first.
pub fn default_rules() -> Vec<ClassifierRule> {
    use Matcher::*;
    let log = |s: &str| format!("Program log: Instruction: {s}");
    vec![
        ClassifierRule::new(ProgramId(VOTE_PROGRAM.into()), "vote"),
        ClassifierRule::new(ProgramId(PYTH_ORACLE_PROGRAM.into()), "oracle"),
        ClassifierRule::new(InstructionType("transfer".into()), "transfer"),
        ClassifierRule::new(InstructionType("transferChecked".into()), "transfer"),
        ClassifierRule::new(InstructionType("transferWithSeed".into()), "transfer"),
        ClassifierRule::new(InstructionType("create".into()), "token"),
        ClassifierRule::new(InstructionType("createIdempotent".into()), "token"),
        ClassifierRule::new(InstructionType("mintTo".into()), "token"),
        ClassifierRule::new(InstructionType("mintToChecked".into()), "token"),
        ClassifierRule::new(ProgramId(BPF_UPGRADEABLE_LOADER.into()), "bpf-loader"),
        ClassifierRule::new(ProgramId(ADDRESS_LOOKUP_TABLE_PROGRAM.into()), "system"),
        ClassifierRule::new(LogEquals(log("FunctionVerify")), "system"),
        ClassifierRule::new(LogEquals(log("FleetStateHandler")), "system"),
        ClassifierRule::new(LogEquals(log("ScanForSurveyDataUnits")), "scan"),
        ClassifierRule::new(LogEquals(log("OracleHeartbeat")), "oracle"),
        ClassifierRule::new(LogEquals("Program log: Oracle".into()), "oracle"),
        ClassifierRule::new(LogEquals(log("Swap")), "swap"),
        ClassifierRule::new(LogEquals(log("Route")), "swap"),
        ClassifierRule::new(LogEquals(log("SharedAccountsRoute")), "swap"),
        ClassifierRule::new(LogEquals(log("Transfer")), "transfer"),
        ClassifierRule::new(LogEquals(log("TransferChecked")), "transfer"),
        ClassifierRule::new(LogContains("Cancel".into()), "cancel-order"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ix(program_id: &str, kind: Option<&str>) -> InstructionFacts {
        InstructionFacts {
            program_id: Some(program_id.to_string()),
            program: None,
            kind: kind.map(str::to_string),
        }
    }

    #[test]
    fn vote_by_program_id() {
        let facts = TxFacts {
            instructions: vec![ix(VOTE_PROGRAM, Some("towersync"))],
            logs: vec![],
        };
        assert_eq!(Classifier::default().classify(&facts), "vote");
    }

    #[test]
    fn compute_budget_prefix_is_skipped() {
        let facts = TxFacts {
            instructions: vec![
                ix(COMPUTE_BUDGET_PROGRAM, Some("setComputeUnitLimit")),
                ix(COMPUTE_BUDGET_PROGRAM, Some("setComputeUnitPrice")),
                ix(SYSTEM_PROGRAM, Some("transfer")),
            ],
            logs: vec![],
        };
        assert_eq!(Classifier::default().classify(&facts), "transfer");
    }

    #[test]
    fn only_compute_budget() {
        let facts = TxFacts {
            instructions: vec![ix(COMPUTE_BUDGET_PROGRAM, None)],
            logs: vec![],
        };
        assert_eq!(Classifier::default().classify(&facts), TYPE_COMPUTE_BUDGET);
    }

    #[test]
    fn log_rules_and_fallbacks() {
        let c = Classifier::default();
        let swap = TxFacts {
            instructions: vec![ix("JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4", None)],
            logs: vec![
                "Program log: Instruction: Route".into(),
                "Program log: CancelAllOrders".into(),
            ],
        };
        assert_eq!(c.classify(&swap), "swap");

        let cancel = TxFacts {
            instructions: vec![ix("srmqPvymJeFKQ4zGQed1GFppgkRHL9kaELCbyksJtPX", None)],
            logs: vec!["Program log: Instruction: CancelOrderV2".into()],
        };
        assert_eq!(c.classify(&cancel), "cancel-order");

        let other = TxFacts {
            instructions: vec![ix("SomeProgram1111111111111111111111111111111", None)],
            logs: vec![],
        };
        assert_eq!(c.classify(&other), TYPE_PROGRAM_CALL);
        assert_eq!(c.classify(&TxFacts::default()), TYPE_UNKNOWN);
    }

    #[test]
    fn custom_rules_replace_defaults() {
        let rules: Vec<ClassifierRule> = serde_json::from_str(
            r#"[{"match":"program","value":"spl-memo","tx_type":"memo"}]"#,
        )
        .unwrap();
        let c = Classifier::new(rules);
        let facts = TxFacts {
            instructions: vec![InstructionFacts {
                program_id: Some("MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr".into()),
                program: Some("spl-memo".into()),
                kind: None,
            }],
            logs: vec![],
        };
        assert_eq!(c.classify(&facts), "memo");
        let vote = TxFacts {
            instructions: vec![ix(VOTE_PROGRAM, None)],
            logs: vec![],
        };
        assert_eq!(c.classify(&vote), TYPE_PROGRAM_CALL);
    }
}
