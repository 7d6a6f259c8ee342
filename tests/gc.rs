use std::fs;
use std::os::unix::fs::symlink;

use anyhow::Result;
use predicates::prelude::*;
use tempfile::tempdir;

mod common;

use common::*;

#[test]
fn an_empty_repository_has_nothing_to_sweep() -> Result<()> {
    let dir = tempdir()?;
    let repo = dir.path().join("repo");
    let data = dir.path().join("data");
    fs::create_dir_all(&data)?;
    make_repo(&repo, &format!("[copy]\n{}\n", data.display()));
    backup_yes(&repo)?.assert().success();

    cli_run(&repo)?
        .arg("gc")
        .assert()
        .success()
        .stdout(predicate::str::contains("deleted 0 items"));
    assert!(repo.join("config").exists());
    assert!(repo.join("metadata").exists());
    assert!(repo.join("lockfile").exists());
    Ok(())
}

#[test]
fn strays_are_swept_and_counted() -> Result<()> {
    let dir = tempdir()?;
    let repo = dir.path().join("repo");
    make_repo(&repo, "[copy]\n/nothing\n");

    // 20 empty files, 3 symlinks, and their 2 directories: 25 items,
    // none referenced by anything.
    fs::create_dir_all(repo.join("a/b"))?;
    for i in 0..10 {
        fs::write(repo.join(format!("a/file{i}")), b"")?;
        fs::write(repo.join(format!("a/b/file{i}")), b"")?;
    }
    symlink("file0", repo.join("a/link0"))?;
    symlink("/nowhere/at/all", repo.join("a/link1"))?;
    symlink("../file3", repo.join("a/b/link2"))?;

    cli_run(&repo)?
        .arg("gc")
        .assert()
        .success()
        .stdout(predicate::str::contains("deleted 25 items (0 B)"));
    assert!(!repo.join("a").exists());
    assert!(repo.join("config").exists());
    Ok(())
}

#[test]
fn sizes_of_swept_files_add_up() -> Result<()> {
    let dir = tempdir()?;
    let repo = dir.path().join("repo");
    make_repo(&repo, "[copy]\n/nothing\n");

    fs::create_dir_all(repo.join("foo"))?;
    fs::write(repo.join("foo/bar.txt"), b"Test Data")?;
    fs::write(repo.join("example.txt"), [b'x'; 18])?;

    cli_run(&repo)?
        .arg("gc")
        .assert()
        .success()
        .stdout(predicate::str::contains("deleted 3 items (27 B)"));
    Ok(())
}

#[test]
fn referenced_objects_survive_a_sweep() -> Result<()> {
    let dir = tempdir()?;
    let repo = dir.path().join("repo");
    let data = dir.path().join("data");
    fs::create_dir_all(&data)?;
    fs::write(data.join("keeper"), vec![b'k'; 400])?;
    make_repo(&repo, &format!("[copy]\n{}\n", data.display()));
    backup_yes(&repo)?.assert().success();

    let objects = objects_in(&repo);
    assert_eq!(objects.len(), 1);

    // A backup followed by nothing else gives gc nothing to do.
    cli_run(&repo)?
        .arg("gc")
        .assert()
        .success()
        .stdout(predicate::str::contains("deleted 0 items"));
    assert_eq!(objects_in(&repo), objects);

    // Restores still work afterwards, naturally.
    fs::remove_dir_all(&data)?;
    cli_run(&repo)?.arg("1").assert().success();
    assert_eq!(fs::read(data.join("keeper"))?, vec![b'k'; 400]);
    Ok(())
}

#[test]
fn a_crashed_backup_cleans_up_to_nothing() -> Result<()> {
    let dir = tempdir()?;
    let repo = dir.path().join("repo");
    let data = dir.path().join("data");
    fs::create_dir_all(&data)?;
    fs::write(data.join("steady"), vec![b's'; 300])?;
    make_repo(&repo, &format!("[copy]\n{}\n", data.display()));
    backup_yes(&repo)?.assert().success();

    // Pretend a second backup died after writing objects but before the
    // metadata rename: two orphaned objects and a scratch file remain.
    fs::create_dir_all(repo.join("f/00"))?;
    fs::write(
        repo.join("f/00/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaxabx0"),
        b"orphan one",
    )?;
    fs::write(
        repo.join("f/00/bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbxcdx0"),
        b"orphan two",
    )?;
    fs::write(repo.join("tmp-file"), b"half-written metadata")?;

    // The sweep takes the orphans, their directories, and the scratch
    // file; the completed backup is untouched.
    cli_run(&repo)?
        .arg("gc")
        .assert()
        .success()
        .stdout(predicate::str::contains("deleted 5 items"));
    assert!(!repo.join("tmp-file").exists());
    assert_eq!(objects_in(&repo).len(), 1);

    // And the next run picks up as if the crash never happened.
    cli_run(&repo)?
        .assert()
        .success()
        .stdout(predicate::str::contains("nothing to back up"));
    Ok(())
}

#[test]
fn two_commands_cannot_share_a_repository() -> Result<()> {
    let dir = tempdir()?;
    let repo = dir.path().join("repo");
    make_repo(&repo, "[copy]\n/nothing\n");

    let repo_utf8 = camino::Utf8Path::from_path(&repo).unwrap();
    let held = nb::lock::RepoLock::acquire(repo_utf8)?;

    cli_run(&repo)?
        .arg("gc")
        .assert()
        .failure()
        .stderr(predicate::str::contains("in use by another process"));

    drop(held);
    cli_run(&repo)?.arg("gc").assert().success();
    Ok(())
}
