//! End-to-end collection against real repositories built with libgit2.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use commitinfo_indexer::query::EmailAddress;
use commitinfo_indexer::{CommitInfoEngine, IndexerConfig, RepoSettings};
use commitinfo_types::{CommitId, ContributionKind, Day};
use git2::{Oid, Repository, Signature, Time};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const DAY: i64 = 86_400;
const MAIN: &str = "refs/heads/main";

fn write_tree(repo: &Repository, files: &BTreeMap<&str, &str>) -> Oid {
    let mut builder = repo.treebuilder(None).expect("tree builder");
    let mut dirs: BTreeMap<&str, BTreeMap<&str, &str>> = BTreeMap::new();
    for (path, content) in files {
        match path.split_once('/') {
            Some((dir, rest)) => {
                dirs.entry(dir).or_default().insert(rest, content);
            }
            None => {
                let blob = repo.blob(content.as_bytes()).expect("blob");
                builder.insert(path, blob, 0o100644).expect("insert blob");
            }
        }
    }
    for (dir, children) in dirs {
        let tree = write_tree(repo, &children);
        builder.insert(dir, tree, 0o040000).expect("insert tree");
    }
    builder.write().expect("write tree")
}

/// Commits `files` as the full tree on top of `parents` and points `ref_name` at it.
fn commit(
    repo: &Repository,
    ref_name: &str,
    parents: &[Oid],
    files: &[(&str, &str)],
    message: &str,
    author: &str,
    seconds: i64,
) -> Oid {
    let files: BTreeMap<&str, &str> = files.iter().copied().collect();
    let tree = repo.find_tree(write_tree(repo, &files)).expect("find tree");
    let email = format!("{}@example.com", author.to_ascii_lowercase());
    let sig = Signature::new(author, &email, &Time::new(seconds, 0)).expect("signature");
    let parents = parents
        .iter()
        .map(|oid| repo.find_commit(*oid).expect("parent"))
        .collect::<Vec<_>>();
    let parent_refs = parents.iter().collect::<Vec<_>>();
    let oid = repo
        .commit(None, &sig, &sig, message, &tree, &parent_refs)
        .expect("commit");
    repo.reference(ref_name, oid, true, "test update")
        .expect("update ref");
    oid
}

fn id(oid: Oid) -> CommitId {
    CommitId::from_slice(oid.as_bytes()).expect("20 byte oid")
}

fn engine(data_dir: &Path, git_dir: &Path, batch_size: usize) -> CommitInfoEngine {
    let engine = CommitInfoEngine::standalone(
        IndexerConfig::new(data_dir.to_path_buf()).with_collect_batch_size(batch_size),
    );
    engine
        .register(RepoSettings::new(1, "demo", git_dir.to_path_buf()))
        .expect("register");
    engine
}

struct RenameHistory {
    git: TempDir,
    c1: Oid,
    c2: Oid,
    c3: Oid,
}

/// `c1 <- c2 <- c3`: c2 renames old.txt to new.txt, c3 adds five lines to it.
fn rename_history() -> RenameHistory {
    let git = tempfile::tempdir().expect("tempdir");
    let repo = Repository::init_bare(git.path()).expect("init");
    let c1 = commit(&repo, MAIN, &[], &[("old.txt", "a\nb\nc\n")], "add old", "Ada", DAY);
    let c2 = commit(&repo, MAIN, &[c1], &[("new.txt", "a\nb\nc\n")], "rename", "Ada", 2 * DAY);
    let c3 = commit(
        &repo,
        MAIN,
        &[c2],
        &[("new.txt", "a\nb\nc\nd\ne\nf\ng\nh\n")],
        "extend, fixes #12",
        "Bob",
        3 * DAY,
    );
    RenameHistory { git, c1, c2, c3 }
}

#[test]
fn linear_history_with_rename() {
    let history = rename_history();
    let data = tempfile::tempdir().expect("tempdir");
    let engine = engine(data.path(), history.git.path(), 10_000);

    let outcome = engine.collect(1, id(history.c3), MAIN).expect("collect");
    assert_eq!(outcome.commits_collected, 3);
    assert_eq!(outcome.attached_issues, BTreeSet::from([12]));

    assert_eq!(engine.commit_count(1).expect("count"), 3);
    assert_eq!(engine.files(1).expect("files"), vec!["new.txt"]);
    assert_eq!(engine.file_count(1).expect("file count"), 1);
    assert_eq!(
        engine.history_paths(1, "new.txt").expect("history"),
        BTreeSet::from(["old.txt".to_string()])
    );

    let stats = engine.line_increments(1).expect("line stats");
    assert_eq!(stats[&Day(3)]["Text"], 5);
    assert_eq!(stats[&Day(1)]["Text"], 3);
    assert!(!stats.contains_key(&Day(2)));

    assert_eq!(engine.fix_commits(1, 12).expect("fixes"), vec![id(history.c3)]);
    assert_eq!(
        engine.descendants(1, &[id(history.c2)]).expect("descendants"),
        {
            let mut expected = vec![id(history.c2), id(history.c3)];
            expected.sort();
            expected
        }
    );
    let users = engine.users(1).expect("users");
    assert_eq!(
        users.iter().map(|user| user.name.as_str()).collect::<Vec<_>>(),
        vec!["Ada", "Bob"]
    );
}

#[test]
fn collecting_the_same_tip_again_changes_nothing() {
    let history = rename_history();
    let data = tempfile::tempdir().expect("tempdir");
    let engine = engine(data.path(), history.git.path(), 10_000);

    engine.collect(1, id(history.c3), MAIN).expect("first");
    let before = (
        engine.commit_count(1).expect("count"),
        engine.overall_contributions(1).expect("contributions"),
        engine.line_increments(1).expect("stats"),
    );

    let again = engine.collect(1, id(history.c3), MAIN).expect("second");
    assert_eq!(again.commits_collected, 0);
    assert!(again.checkpoints.is_empty());
    assert!(!again.line_stats_updated && !again.contributions_updated && !again.files_updated);

    let after = (
        engine.commit_count(1).expect("count"),
        engine.overall_contributions(1).expect("contributions"),
        engine.line_increments(1).expect("stats"),
    );
    assert_eq!(before, after);
}

#[test]
fn incremental_collection_counts_each_commit_once() {
    let history = rename_history();
    let data = tempfile::tempdir().expect("tempdir");
    let engine = engine(data.path(), history.git.path(), 10_000);

    engine.collect(1, id(history.c2), MAIN).expect("c2");
    // A topic branch pointing into already collected history adds nothing.
    engine
        .collect(1, id(history.c1), "refs/heads/topic")
        .expect("topic");
    let outcome = engine.collect(1, id(history.c3), MAIN).expect("c3");
    assert_eq!(outcome.commits_collected, 1);
    assert_eq!(engine.commit_count(1).expect("count"), 3);

    let overall = engine.overall_contributions(1).expect("contributions");
    let commits: i32 = overall.values().map(|contribution| contribution.commits).sum();
    assert_eq!(commits, 3);
}

#[test]
fn batched_and_single_pass_collection_agree() {
    let git = tempfile::tempdir().expect("tempdir");
    let repo = Repository::init_bare(git.path()).expect("init");
    let c1 = commit(&repo, MAIN, &[], &[("src/lib.rs", "fn a() {}\n")], "one", "Ada", DAY);
    let c2 = commit(
        &repo,
        MAIN,
        &[c1],
        &[("src/lib.rs", "fn a() {}\nfn b() {}\n")],
        "two",
        "Ada",
        2 * DAY,
    );
    let t1 = commit(
        &repo,
        "refs/heads/topic",
        &[c1],
        &[("src/lib.rs", "fn a() {}\n"), ("docs/readme.md", "# demo\n\nhello\n")],
        "docs, closes #3",
        "Bob",
        2 * DAY + 60,
    );
    let merge = commit(
        &repo,
        MAIN,
        &[c2, t1],
        &[
            ("src/lib.rs", "fn a() {}\nfn b() {}\n"),
            ("docs/readme.md", "# demo\n\nhello\n"),
        ],
        "merge topic",
        "Ada",
        3 * DAY,
    );
    let c4 = commit(
        &repo,
        MAIN,
        &[merge],
        &[
            ("src/main.rs", "fn a() {}\nfn b() {}\n"),
            ("docs/readme.md", "# demo\n\nhello\n"),
        ],
        "move lib to main",
        "Bob",
        4 * DAY,
    );

    let one_pass_dir = tempfile::tempdir().expect("tempdir");
    let batched_dir = tempfile::tempdir().expect("tempdir");
    let one_pass = engine(one_pass_dir.path(), git.path(), 10_000);
    let batched = engine(batched_dir.path(), git.path(), 1);

    let single = one_pass.collect(1, id(c4), MAIN).expect("one pass");
    let many = batched.collect(1, id(c4), MAIN).expect("batched");
    assert_eq!(single.checkpoints, vec![id(c4)]);
    assert!(many.checkpoints.len() > 1);
    assert_eq!(single.commits_collected, 5);
    assert_eq!(many.commits_collected, 5);

    for engine in [&one_pass, &batched] {
        assert_eq!(engine.commit_count(1).expect("count"), 5);
    }
    assert_eq!(one_pass.users(1).expect("users"), batched.users(1).expect("users"));
    assert_eq!(one_pass.files(1).expect("files"), batched.files(1).expect("files"));
    assert_eq!(
        one_pass.line_increments(1).expect("stats"),
        batched.line_increments(1).expect("stats")
    );
    assert_eq!(
        one_pass.overall_contributions(1).expect("contributions"),
        batched.overall_contributions(1).expect("contributions")
    );
    assert_eq!(
        one_pass
            .top_contributors(1, 10, ContributionKind::Commits, Day(0), Day(10))
            .expect("top"),
        batched
            .top_contributors(1, 10, ContributionKind::Commits, Day(0), Day(10))
            .expect("top")
    );
    assert_eq!(
        one_pass.history_paths(1, "src/main.rs").expect("history"),
        batched.history_paths(1, "src/main.rs").expect("history")
    );
    assert_eq!(
        one_pass.descendants(1, &[id(c1)]).expect("descendants"),
        batched.descendants(1, &[id(c1)]).expect("descendants")
    );
    assert_eq!(one_pass.fix_commits(1, 3).expect("fixes"), vec![id(t1)]);
    assert_eq!(batched.fix_commits(1, 3).expect("fixes"), vec![id(t1)]);

    // Mainline is c1, c2, the merge and c4. Merges are not contributions.
    let overall = one_pass.overall_contributions(1).expect("contributions");
    let commits: i32 = overall.values().map(|contribution| contribution.commits).sum();
    assert_eq!(commits, 3);
}

#[test]
fn force_push_rebuilds_mainline_aggregates() {
    let history = rename_history();
    let data = tempfile::tempdir().expect("tempdir");
    let engine = engine(data.path(), history.git.path(), 10_000);
    engine.collect(1, id(history.c3), MAIN).expect("collect");

    let repo = Repository::open_bare(history.git.path()).expect("open");
    let rewritten = commit(
        &repo,
        MAIN,
        &[history.c1],
        &[("old.txt", "a\n")],
        "rewrite",
        "Cy",
        5 * DAY,
    );

    let outcome = engine.collect(1, id(rewritten), MAIN).expect("collect rewritten");
    assert_eq!(outcome.commits_collected, 1);
    assert!(outcome.line_stats_updated && outcome.contributions_updated);

    let stats = engine.line_increments(1).expect("stats");
    assert_eq!(
        stats.keys().copied().collect::<Vec<_>>(),
        vec![Day(1), Day(5)]
    );
    assert_eq!(stats[&Day(5)]["Text"], -2);

    let overall = engine.overall_contributions(1).expect("contributions");
    assert_eq!(overall.keys().copied().collect::<Vec<_>>(), vec![Day(1), Day(5)]);
    assert_eq!(engine.files(1).expect("files"), vec!["old.txt"]);
    // Commits stay collected after the rewrite; only the mainline aggregates restart.
    assert_eq!(engine.commit_count(1).expect("count"), 4);
}

#[test]
fn export_and_import_preserve_queries() {
    let history = rename_history();
    let data = tempfile::tempdir().expect("tempdir");
    let engine = engine(data.path(), history.git.path(), 10_000);
    engine.collect(1, id(history.c3), MAIN).expect("collect");

    let archive = data.path().join("repo-1.zst");
    engine.export(1, &archive).expect("export");

    let restored_dir = tempfile::tempdir().expect("tempdir");
    let restored = self::engine(restored_dir.path(), history.git.path(), 10_000);
    restored.import(1, &archive).expect("import");
    assert!(!restored.check_version(1).expect("version"));
    assert_eq!(restored.commit_count(1).expect("count"), 3);
    assert_eq!(
        restored.history_paths(1, "new.txt").expect("history"),
        BTreeSet::from(["old.txt".to_string()])
    );

    let again = restored.collect(1, id(history.c3), MAIN).expect("collect");
    assert_eq!(again.commits_collected, 0);
}

#[test]
fn merges_leave_root_counts_to_the_merged_authors() {
    let git = tempfile::tempdir().expect("tempdir");
    let repo = Repository::init_bare(git.path()).expect("init");
    let c1 = commit(&repo, MAIN, &[], &[("src/lib.rs", "fn a() {}\n")], "one", "Ada", DAY);
    let t1 = commit(
        &repo,
        "refs/heads/topic",
        &[c1],
        &[("src/lib.rs", "fn a() {}\n"), ("notes/one.md", "one\n")],
        "first note",
        "Cy",
        DAY + 60,
    );
    let m1 = commit(
        &repo,
        MAIN,
        &[c1, t1],
        &[("src/lib.rs", "fn a() {}\n"), ("notes/one.md", "one\n")],
        "merge notes",
        "Bob",
        2 * DAY,
    );
    let t2 = commit(
        &repo,
        "refs/heads/topic",
        &[t1],
        &[
            ("src/lib.rs", "fn a() {}\n"),
            ("notes/one.md", "one\n"),
            ("notes/two.md", "two\n"),
        ],
        "second note",
        "Cy",
        2 * DAY + 60,
    );
    let m2 = commit(
        &repo,
        MAIN,
        &[m1, t2],
        &[
            ("src/lib.rs", "fn a() {}\n"),
            ("notes/one.md", "one\n"),
            ("notes/two.md", "two\n"),
        ],
        "merge more notes",
        "Bob",
        3 * DAY,
    );

    let data = tempfile::tempdir().expect("tempdir");
    let engine = engine(data.path(), git.path(), 10_000);
    let outcome = engine.collect(1, id(m2), MAIN).expect("collect");
    assert_eq!(outcome.commits_collected, 5);

    let users = BTreeMap::from([
        (1, vec![EmailAddress::verified("bob@example.com")]),
        (2, vec![EmailAddress::verified("ada@example.com")]),
    ]);
    // Nobody touched docs/, so both users are ranked by their root counts.
    let sorted = engine
        .sort_users_by_contribution(1, users, vec!["docs/guide.md".to_string()])
        .expect("sort");
    assert_eq!(sorted, vec![2, 1]);
}
