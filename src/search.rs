//! Selecting what to back up: the rule tree, the config format that
//! builds it, and the filesystem walk that applies it.

use anyhow::{Context, Result, bail, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use tracing::*;

use crate::fs::{FileKind, Filesystem, Lstat};
use crate::metadata::Policy;

pub const CONFIG_NAME: &str = "config";

/// One rule: a path component and the policy taking effect at it.
#[derive(Debug)]
pub struct RuleNode {
    pub name: String,
    /// `Policy::None` for components that only exist to reach deeper rules.
    pub policy: Policy,
    pub subrules: Vec<RuleNode>,
}

/// The parsed selection config.
#[derive(Debug, Default)]
pub struct SearchTree {
    /// Rules for the first path components under `/`.
    pub rules: Vec<RuleNode>,
    /// Regexes matched against full paths; matches are neither yielded
    /// nor descended into.
    pub ignore_rules: Vec<Regex>,
}

impl SearchTree {
    /// Parses the config format: `[copy]`/`[mirror]`/`[track]` sections
    /// holding one absolute path per line, an `[ignore]` section holding
    /// one regex per line, `#` comments.
    pub fn parse(text: &str) -> Result<SearchTree> {
        enum Section {
            Policy(Policy),
            Ignore,
        }

        let mut tree = SearchTree::default();
        let mut section = None;
        for (number, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let context = || format!("config line {}", number + 1);
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = Some(match name {
                    "copy" => Section::Policy(Policy::Copy),
                    "mirror" => Section::Policy(Policy::Mirror),
                    "track" => Section::Policy(Policy::Track),
                    "ignore" => Section::Ignore,
                    _ => bail!("{}: unknown section [{name}]", context()),
                });
                continue;
            }
            match &section {
                None => bail!("{}: pattern before any section header", context()),
                Some(Section::Ignore) => tree
                    .ignore_rules
                    .push(Regex::new(line).with_context(context)?),
                Some(Section::Policy(policy)) => {
                    tree.add_rule(line, *policy).with_context(context)?
                }
            }
        }
        Ok(tree)
    }

    fn add_rule(&mut self, path: &str, policy: Policy) -> Result<()> {
        fn descend<'a>(level: &'a mut Vec<RuleNode>, component: &str) -> &'a mut RuleNode {
            let position = match level.iter().position(|r| r.name == component) {
                Some(found) => found,
                None => {
                    level.push(RuleNode {
                        name: component.to_owned(),
                        policy: Policy::None,
                        subrules: Vec::new(),
                    });
                    level.len() - 1
                }
            };
            &mut level[position]
        }

        ensure!(path.starts_with('/'), "{path} isn't absolute");
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let Some((last, intermediate)) = components.split_last() else {
            bail!("can't back up / itself");
        };

        let mut level = &mut self.rules;
        for component in intermediate {
            level = &mut descend(level, component).subrules;
        }
        let rule = descend(level, last);
        ensure!(
            rule.policy == Policy::None || rule.policy == policy,
            "{path} already has a policy"
        );
        rule.policy = policy;
        Ok(())
    }

    pub fn is_ignored(&self, path: &Utf8Path) -> bool {
        self.ignore_rules.iter().any(|r| r.is_match(path.as_str()))
    }
}

/// One filesystem entity the walk found worth looking at.
#[derive(Debug)]
pub struct SearchResult {
    pub path: Utf8PathBuf,
    pub stat: Lstat,
    pub policy: Policy,
    /// True when the policy came from an enclosing rule rather than one
    /// naming this path.
    pub policy_inherited: bool,
}

/// Walks the filesystem as the rule tree directs - depth first, children
/// in lexicographic order - calling `visit` for every selected entity.
///
/// Parents are always visited before their contents. Symlinks are leaves:
/// they're reported, never followed. Entities matching an ignore rule are
/// neither reported nor entered.
pub fn search(
    fs: &dyn Filesystem,
    tree: &SearchTree,
    visit: &mut dyn FnMut(SearchResult) -> Result<()>,
) -> Result<()> {
    walk_dir(fs, tree, Utf8Path::new("/"), &tree.rules, None, visit)
}

fn walk_dir(
    fs: &dyn Filesystem,
    tree: &SearchTree,
    dir: &Utf8Path,
    subrules: &[RuleNode],
    inherited: Option<Policy>,
    visit: &mut dyn FnMut(SearchResult) -> Result<()>,
) -> Result<()> {
    for name in fs
        .read_dir(dir)
        .with_context(|| format!("Couldn't read {dir}"))?
    {
        let path = dir.join(&name);
        if tree.is_ignored(&path) {
            trace!("{path} ignored");
            continue;
        }
        let rule = subrules.iter().find(|r| r.name == name);
        let (policy, policy_inherited) = match (rule, inherited) {
            (Some(r), _) if r.policy != Policy::None => (r.policy, false),
            (_, Some(p)) => (p, true),
            (Some(_), None) => (Policy::None, false),
            // Nothing selects this entry.
            (None, None) => continue,
        };

        let stat = match fs.lstat(&path) {
            // It vanished between the readdir and now; pretend we never
            // saw it, like the rest of this run will.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            other => other.with_context(|| format!("Couldn't stat {path}"))?,
        };

        visit(SearchResult {
            path: path.clone(),
            stat,
            policy,
            policy_inherited,
        })?;

        if stat.kind == FileKind::Directory {
            let deeper_rules = rule.map(|r| r.subrules.as_slice()).unwrap_or(&[]);
            let deeper_inherited = if policy != Policy::None {
                Some(policy)
            } else {
                None
            };
            walk_dir(fs, tree, &path, deeper_rules, deeper_inherited, visit)?;
        }
    }
    Ok(())
}
