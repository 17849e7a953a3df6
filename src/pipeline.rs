//! 安装流程编排：解析 → 获取 → 安装 →（可选）注册定时任务 → 验证
//!
//! 安装成功与否只取决于前三步。定时任务注册和验证的结果单独记录在
//! `InstallReport` 中，失败也不会让安装命令失败。

use crate::config::Config;
use crate::descriptor::{self, PackageDescriptor, VerificationStep};
use crate::error::{Error, Result};
use crate::fetcher::Fetcher;
use crate::installer::{self, InstallLock, Installer};
use crate::registry::{InstalledPackage, PackageRegistry};
use crate::service::{ServiceController, ServiceDefinition, ServiceRegistrar};
use crate::verifier::{self, VerificationReport};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct InstallOptions {
    pub verify: bool,
    pub register_schedule: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            verify: true,
            register_schedule: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub label: String,
    pub service_file: PathBuf,
    pub activated: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome<T> {
    Skipped,
    Completed(T),
    Failed { message: String },
}

impl<T> StepOutcome<T> {
    fn from_result(result: Result<T>, step: &str) -> Self {
        match result {
            Ok(value) => StepOutcome::Completed(value),
            Err(e) => {
                log::error!("{}: {}", step, e);
                StepOutcome::Failed {
                    message: e.to_string(),
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InstallReport {
    pub name: String,
    pub revision: Option<String>,
    pub files: Vec<PathBuf>,
    pub missing_dependencies: Vec<String>,
    pub registration: StepOutcome<Registration>,
    pub verification: StepOutcome<VerificationReport>,
}

pub struct Pipeline<'a> {
    config: &'a Config,
    registry: &'a mut dyn PackageRegistry,
    controller: &'a dyn ServiceController,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a Config,
        registry: &'a mut dyn PackageRegistry,
        controller: &'a dyn ServiceController,
    ) -> Self {
        Self {
            config,
            registry,
            controller,
        }
    }

    pub async fn install(
        &mut self,
        descriptor_path: &Path,
        options: InstallOptions,
    ) -> Result<InstallReport> {
        let descriptor = descriptor::load_descriptor(descriptor_path)?;
        self.install_descriptor(descriptor, options).await
    }

    pub async fn install_descriptor(
        &mut self,
        descriptor: PackageDescriptor,
        options: InstallOptions,
    ) -> Result<InstallReport> {
        let name = descriptor.name.clone();
        let _lock = InstallLock::acquire(&self.config.lock_dir(), &name)?;
        log::info!("开始安装 {}", name);

        let missing_dependencies = self.missing_dependencies(&descriptor)?;
        for dep in &missing_dependencies {
            log::warn!("{} 依赖的 {} 未安装", name, dep);
        }

        let fetcher = Fetcher::new(Duration::from_secs(self.config.fetch_timeout_secs))?;
        let fetched = fetcher.fetch(&descriptor.source).await?;

        let previous = self.registry.get(&name)?;
        let files = Installer::new(&self.config.prefix).run(fetched.root(), &descriptor.install)?;

        if let Some(previous) = &previous {
            let stale: Vec<PathBuf> = previous
                .files
                .iter()
                .filter(|f| !files.contains(f))
                .cloned()
                .collect();
            if !stale.is_empty() {
                log::info!("清理旧版本遗留的 {} 个文件", stale.len());
                installer::remove_files(&self.config.prefix, &stale);
            }
        }

        let mut service_file = previous.and_then(|p| p.service_file);
        if descriptor.service.is_none() {
            if let Some(stale) = service_file.take() {
                log::info!("新版本不再定义定时任务，删除 {}", stale.display());
                let registrar = ServiceRegistrar::new(&self.config.launch_agents_dir);
                if let Err(e) = registrar.unregister(&stale) {
                    // 保留记录，卸载时再删
                    log::warn!("{}", e);
                    service_file = Some(stale);
                }
            }
        }

        self.registry.record(InstalledPackage {
            name: name.clone(),
            descriptor: descriptor.clone(),
            revision: fetched.revision.clone(),
            files: files.clone(),
            service_file,
            installed_at: Utc::now(),
        })?;
        log::info!("{} 安装完成，共 {} 个文件", name, files.len());

        let registration = if options.register_schedule && descriptor.service.is_some() {
            StepOutcome::from_result(self.register_schedule(&name), "注册定时任务")
        } else {
            StepOutcome::Skipped
        };

        let verification = if options.verify {
            let result = verification_step(&name, descriptor.test.as_ref(), &files)
                .and_then(|step| verifier::verify(&self.config.prefix, &step));
            StepOutcome::from_result(result, "验证")
        } else {
            StepOutcome::Skipped
        };

        Ok(InstallReport {
            name,
            revision: fetched.revision.clone(),
            files,
            missing_dependencies,
            registration,
            verification,
        })
    }

    /// 依赖已记录为已安装，或者 PATH 中有同名可执行文件，即视为满足
    pub fn missing_dependencies(&self, descriptor: &PackageDescriptor) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for dep in &descriptor.dependencies {
            if self.registry.contains(dep)? || which::which(dep).is_ok() {
                continue;
            }
            missing.push(dep.clone());
        }
        Ok(missing)
    }

    fn installed(&self, name: &str) -> Result<InstalledPackage> {
        self.registry
            .get(name)?
            .ok_or_else(|| Error::NotFound(format!("{} 未安装", name)))
    }

    fn definition(&self, package: &InstalledPackage) -> Result<ServiceDefinition> {
        let schedule = package.descriptor.service.as_ref().ok_or_else(|| {
            Error::RegistrationError(format!("{} 没有定义定时任务", package.name))
        })?;
        ServiceDefinition::resolve(
            &package.name,
            schedule,
            &self.config.label_prefix,
            &self.config.prefix,
        )
    }

    /// 写入定时任务描述文件。只有 `auto_enabled = true` 时才会随后启用
    pub fn register_schedule(&mut self, name: &str) -> Result<Registration> {
        let mut package = self.installed(name)?;
        let definition = self.definition(&package)?;
        let registrar = ServiceRegistrar::new(&self.config.launch_agents_dir);
        let service_file = registrar.register(&definition)?;

        // 标签变化后旧文件名不同，需要删掉，否则卸载时会遗留
        if let Some(previous) = package.service_file.as_ref().filter(|p| **p != service_file) {
            log::info!("删除旧的定时任务描述文件 {}", previous.display());
            registrar.unregister(previous)?;
        }
        package.service_file = Some(service_file.clone());
        self.registry.record(package)?;

        let activated = if definition.auto_enabled {
            self.controller.activate(&definition.label, &service_file)?;
            true
        } else {
            log::info!("{} 需要手动启用: formulary activate {}", definition.label, name);
            false
        };

        Ok(Registration {
            label: definition.label,
            service_file,
            activated,
        })
    }

    pub fn activate(&self, name: &str) -> Result<()> {
        let package = self.installed(name)?;
        let definition = self.definition(&package)?;
        let service_file = package
            .service_file
            .filter(|p| p.exists())
            .ok_or_else(|| {
                Error::RegistrationError(format!(
                    "{} 的定时任务尚未注册，请先执行 register-schedule",
                    name
                ))
            })?;
        self.controller.activate(&definition.label, &service_file)
    }

    pub fn deactivate(&self, name: &str) -> Result<()> {
        let package = self.installed(name)?;
        let definition = self.definition(&package)?;
        self.controller.deactivate(&definition.label)
    }

    pub fn verify(&self, name: &str) -> Result<VerificationReport> {
        let package = self.installed(name)?;
        let step = verification_step(name, package.descriptor.test.as_ref(), &package.files)?;
        verifier::verify(&self.config.prefix, &step)
    }

    /// 删除已安装文件、定时任务描述文件与记录。不会自动停用任务
    pub fn uninstall(&mut self, name: &str) -> Result<InstalledPackage> {
        let _lock = InstallLock::acquire(&self.config.lock_dir(), name)?;
        let package = self.installed(name)?;

        let removed = installer::remove_files(&self.config.prefix, &package.files);
        log::info!("已删除 {} 个文件", removed.len());

        if let Some(service_file) = &package.service_file {
            ServiceRegistrar::new(&self.config.launch_agents_dir).unregister(service_file)?;
            log::info!("已删除定时任务 {}", service_file.display());
        }

        self.registry.remove(name)?;
        Ok(package)
    }

    pub fn list(&self) -> Result<Vec<InstalledPackage>> {
        self.registry.list()
    }

    pub fn info(&self, name: &str) -> Result<InstalledPackage> {
        self.installed(name)
    }
}

/// 未声明测试时，以 --help 调用第一个安装的文件
fn verification_step(
    name: &str,
    declared: Option<&VerificationStep>,
    files: &[PathBuf],
) -> Result<VerificationStep> {
    if let Some(step) = declared {
        return Ok(step.clone());
    }
    let first = files
        .first()
        .ok_or_else(|| Error::VerificationError(format!("{} 没有已安装的文件", name)))?;
    Ok(VerificationStep {
        command: first.display().to_string(),
        args: vec!["--help".to_string()],
        expected_exit_code: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;
    use std::cell::RefCell;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::{tempdir, TempDir};
    use url::Url;

    #[derive(Default)]
    struct RecordingController {
        calls: RefCell<Vec<String>>,
    }

    impl ServiceController for RecordingController {
        fn activate(&self, label: &str, _service_file: &Path) -> Result<()> {
            self.calls.borrow_mut().push(format!("activate {}", label));
            Ok(())
        }

        fn deactivate(&self, label: &str) -> Result<()> {
            self.calls.borrow_mut().push(format!("deactivate {}", label));
            Ok(())
        }
    }

    struct Fixture {
        _root: TempDir,
        upstream: PathBuf,
        config: Config,
    }

    fn fixture() -> Fixture {
        let root = tempdir().expect("tempdir");
        let upstream = root.path().join("upstream");
        fs::create_dir_all(&upstream).expect("mkdir");
        let script = upstream.join("bear_backup.py");
        fs::write(
            &script,
            "#!/bin/sh\n[ \"$1\" = \"--help\" ] && echo usage && exit 0\nexit 2\n",
        )
        .expect("write");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");

        let config = Config {
            prefix: root.path().join("prefix"),
            state_dir: root.path().join("state"),
            launch_agents_dir: root.path().join("LaunchAgents"),
            label_prefix: "formulary".to_string(),
            fetch_timeout_secs: 5,
        };
        Fixture {
            upstream,
            config,
            _root: root,
        }
    }

    fn bear_descriptor(upstream: &Path, auto_enabled: bool) -> PackageDescriptor {
        let location = Url::from_directory_path(upstream).expect("url");
        descriptor::parse_descriptor(&format!(
            r#"
name = "bear_backup"
homepage = "https://github.com/mivok/bear_backup"

[source]
type = "head"
location = "{location}"

[[install]]
action = "copy_file"
src = "bear_backup.py"
dest_dir = "bin"

[service]
program_arguments = ["{{prefix}}/bin/bear_backup.py", "--notify", "--remove", "~/Dropbox/backups/bear"]
trigger = {{ hour = 0, minute = 0 }}
auto_enabled = {auto_enabled}

[service.environment]
PATH = "/bin:/usr/bin:/usr/local/bin"

[test]
command = "bin/bear_backup.py"
args = ["--help"]
"#
        ))
        .expect("descriptor")
    }

    #[tokio::test]
    async fn bear_backup_scenario_installs_and_verifies() {
        let fx = fixture();
        let mut registry = MemoryRegistry::new();
        let controller = RecordingController::default();
        let mut pipeline = Pipeline::new(&fx.config, &mut registry, &controller);

        let report = pipeline
            .install_descriptor(bear_descriptor(&fx.upstream, false), InstallOptions::default())
            .await
            .expect("install");

        let installed = fx.config.prefix.join("bin/bear_backup.py");
        assert_eq!(report.files, vec![installed.clone()]);
        let mode = fs::metadata(&installed).expect("meta").permissions().mode();
        assert_ne!(mode & 0o111, 0, "installed script must be executable");
        assert!(matches!(report.registration, StepOutcome::Skipped));
        match &report.verification {
            StepOutcome::Completed(v) => assert!(v.passed()),
            other => panic!("unexpected verification: {other:?}"),
        }
        assert!(pipeline.info("bear_backup").is_ok());
        assert!(controller.calls.borrow().is_empty());
    }

    #[tokio::test]
    async fn registration_writes_plist_without_activation() {
        let fx = fixture();
        let mut registry = MemoryRegistry::new();
        let controller = RecordingController::default();
        let mut pipeline = Pipeline::new(&fx.config, &mut registry, &controller);

        let report = pipeline
            .install_descriptor(
                bear_descriptor(&fx.upstream, false),
                InstallOptions {
                    verify: false,
                    register_schedule: true,
                },
            )
            .await
            .expect("install");

        let registration = match report.registration {
            StepOutcome::Completed(r) => r,
            other => panic!("unexpected registration: {other:?}"),
        };
        assert!(!registration.activated);
        assert_eq!(
            registration.service_file,
            fx.config.launch_agents_dir.join("formulary.bear_backup.plist")
        );
        let xml = fs::read_to_string(&registration.service_file).expect("plist");
        assert!(xml.contains(&format!(
            "<string>{}</string>",
            fx.config.prefix.join("bin/bear_backup.py").display()
        )));
        assert!(matches!(report.verification, StepOutcome::Skipped));
        assert!(controller.calls.borrow().is_empty());

        let again = pipeline.register_schedule("bear_backup").expect("re-register");
        assert_eq!(
            fs::read_to_string(&again.service_file).expect("plist"),
            xml
        );
    }

    #[tokio::test]
    async fn auto_enabled_schedule_is_activated() {
        let fx = fixture();
        let mut registry = MemoryRegistry::new();
        let controller = RecordingController::default();
        let mut pipeline = Pipeline::new(&fx.config, &mut registry, &controller);

        pipeline
            .install_descriptor(bear_descriptor(&fx.upstream, true), InstallOptions::default())
            .await
            .expect("install");
        let registration = pipeline.register_schedule("bear_backup").expect("register");

        assert!(registration.activated);
        assert_eq!(
            controller.calls.borrow().as_slice(),
            ["activate formulary.bear_backup".to_string()]
        );
    }

    #[tokio::test]
    async fn registration_failure_does_not_fail_install() {
        let mut fx = fixture();
        // 用一个普通文件占住目录位置，使写入必然失败
        let blocker = fx.config.state_dir.join("not-a-dir");
        fs::create_dir_all(&fx.config.state_dir).expect("mkdir");
        fs::write(&blocker, "x").expect("write");
        fx.config.launch_agents_dir = blocker;

        let mut registry = MemoryRegistry::new();
        let controller = RecordingController::default();
        let mut pipeline = Pipeline::new(&fx.config, &mut registry, &controller);

        let report = pipeline
            .install_descriptor(
                bear_descriptor(&fx.upstream, false),
                InstallOptions {
                    verify: true,
                    register_schedule: true,
                },
            )
            .await
            .expect("install still succeeds");

        assert!(matches!(report.registration, StepOutcome::Failed { .. }));
        assert!(matches!(report.verification, StepOutcome::Completed(_)));
        assert!(pipeline.info("bear_backup").is_ok());
    }

    #[tokio::test]
    async fn missing_source_file_is_install_error_and_not_recorded() {
        let fx = fixture();
        fs::remove_file(fx.upstream.join("bear_backup.py")).expect("remove");
        let mut registry = MemoryRegistry::new();
        let controller = RecordingController::default();
        let mut pipeline = Pipeline::new(&fx.config, &mut registry, &controller);

        let err = pipeline
            .install_descriptor(bear_descriptor(&fx.upstream, false), InstallOptions::default())
            .await
            .expect_err("missing file");

        assert!(matches!(err, Error::InstallError { .. }));
        assert!(!fx.config.prefix.join("bin").exists());
        assert!(matches!(pipeline.info("bear_backup"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn concurrent_install_of_same_name_is_rejected() {
        let fx = fixture();
        let _held = InstallLock::acquire(&fx.config.lock_dir(), "bear_backup").expect("lock");
        let mut registry = MemoryRegistry::new();
        let controller = RecordingController::default();
        let mut pipeline = Pipeline::new(&fx.config, &mut registry, &controller);

        let err = pipeline
            .install_descriptor(bear_descriptor(&fx.upstream, false), InstallOptions::default())
            .await
            .expect_err("locked");
        assert!(matches!(err, Error::AlreadyInstalling(_)));
    }

    #[tokio::test]
    async fn uninstall_removes_files_plist_and_record() {
        let fx = fixture();
        let mut registry = MemoryRegistry::new();
        let controller = RecordingController::default();
        let mut pipeline = Pipeline::new(&fx.config, &mut registry, &controller);

        pipeline
            .install_descriptor(
                bear_descriptor(&fx.upstream, false),
                InstallOptions {
                    verify: false,
                    register_schedule: true,
                },
            )
            .await
            .expect("install");
        let plist = fx.config.launch_agents_dir.join("formulary.bear_backup.plist");
        assert!(plist.exists());

        let removed = pipeline.uninstall("bear_backup").expect("uninstall");
        assert_eq!(removed.name, "bear_backup");
        assert!(!fx.config.prefix.join("bin/bear_backup.py").exists());
        assert!(!plist.exists());
        assert!(pipeline.list().expect("list").is_empty());
        assert!(matches!(
            pipeline.uninstall("bear_backup"),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn activate_requires_registered_schedule() {
        let fx = fixture();
        let mut registry = MemoryRegistry::new();
        let controller = RecordingController::default();
        let mut pipeline = Pipeline::new(&fx.config, &mut registry, &controller);

        pipeline
            .install_descriptor(bear_descriptor(&fx.upstream, false), InstallOptions::default())
            .await
            .expect("install");
        assert!(matches!(
            pipeline.activate("bear_backup"),
            Err(Error::RegistrationError(_))
        ));

        pipeline.register_schedule("bear_backup").expect("register");
        pipeline.activate("bear_backup").expect("activate");
        pipeline.deactivate("bear_backup").expect("deactivate");
        assert_eq!(
            controller.calls.borrow().as_slice(),
            [
                "activate formulary.bear_backup".to_string(),
                "deactivate formulary.bear_backup".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn verify_without_test_section_runs_first_file_with_help() {
        let fx = fixture();
        let mut registry = MemoryRegistry::new();
        let controller = RecordingController::default();
        let mut pipeline = Pipeline::new(&fx.config, &mut registry, &controller);

        let mut descriptor = bear_descriptor(&fx.upstream, false);
        descriptor.test = None;
        let installed = pipeline
            .install_descriptor(descriptor, InstallOptions::default())
            .await
            .expect("install");

        // install 与 verify 使用同一个默认测试
        let during_install = match installed.verification {
            StepOutcome::Completed(v) => v,
            other => panic!("unexpected verification: {other:?}"),
        };
        assert_eq!(during_install.command, fx.config.prefix.join("bin/bear_backup.py"));
        assert_eq!(during_install.args, vec!["--help".to_string()]);
        assert!(during_install.passed());

        let report = pipeline.verify("bear_backup").expect("verify");
        assert_eq!(report.command, during_install.command);
        assert_eq!(report.args, vec!["--help".to_string()]);
        assert!(report.passed());
    }

    #[tokio::test]
    async fn reinstall_removes_stale_files() {
        let fx = fixture();
        fs::write(fx.upstream.join("extra.txt"), "x").expect("write");
        let mut registry = MemoryRegistry::new();
        let controller = RecordingController::default();
        let mut pipeline = Pipeline::new(&fx.config, &mut registry, &controller);

        let mut first = bear_descriptor(&fx.upstream, false);
        first.install.push(descriptor::InstallAction::CopyFile {
            src: "extra.txt".into(),
            dest_dir: "share/bear".into(),
            mode: None,
        });
        pipeline
            .install_descriptor(first, InstallOptions::default())
            .await
            .expect("first install");
        assert!(fx.config.prefix.join("share/bear/extra.txt").exists());

        pipeline
            .install_descriptor(bear_descriptor(&fx.upstream, false), InstallOptions::default())
            .await
            .expect("second install");
        assert!(!fx.config.prefix.join("share").exists());
        assert!(fx.config.prefix.join("bin/bear_backup.py").exists());
    }

    #[tokio::test]
    async fn relabelled_schedule_replaces_old_plist() {
        let fx = fixture();
        let mut registry = MemoryRegistry::new();
        let controller = RecordingController::default();
        let mut pipeline = Pipeline::new(&fx.config, &mut registry, &controller);
        let options = InstallOptions {
            verify: false,
            register_schedule: true,
        };

        pipeline
            .install_descriptor(bear_descriptor(&fx.upstream, false), options)
            .await
            .expect("first install");
        let old_plist = fx.config.launch_agents_dir.join("formulary.bear_backup.plist");
        assert!(old_plist.exists());

        let mut relabelled = bear_descriptor(&fx.upstream, false);
        relabelled.service.as_mut().expect("service").label = Some("io.custom.bear".to_string());
        pipeline
            .install_descriptor(relabelled, options)
            .await
            .expect("reinstall");
        let new_plist = fx.config.launch_agents_dir.join("io.custom.bear.plist");
        assert!(new_plist.exists());
        assert!(!old_plist.exists());
        assert_eq!(
            pipeline.info("bear_backup").expect("info").service_file,
            Some(new_plist.clone())
        );

        pipeline.uninstall("bear_backup").expect("uninstall");
        assert!(!new_plist.exists());
        let leftovers: Vec<_> = fs::read_dir(&fx.config.launch_agents_dir)
            .expect("read dir")
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn reinstall_without_service_removes_plist() {
        let fx = fixture();
        let mut registry = MemoryRegistry::new();
        let controller = RecordingController::default();
        let mut pipeline = Pipeline::new(&fx.config, &mut registry, &controller);

        pipeline
            .install_descriptor(
                bear_descriptor(&fx.upstream, false),
                InstallOptions {
                    verify: false,
                    register_schedule: true,
                },
            )
            .await
            .expect("first install");
        let plist = fx.config.launch_agents_dir.join("formulary.bear_backup.plist");
        assert!(plist.exists());

        let mut without_service = bear_descriptor(&fx.upstream, false);
        without_service.service = None;
        pipeline
            .install_descriptor(without_service, InstallOptions::default())
            .await
            .expect("reinstall");

        assert!(!plist.exists());
        assert_eq!(pipeline.info("bear_backup").expect("info").service_file, None);
    }

    #[test]
    fn dependencies_satisfied_by_registry_or_path() {
        let fx = fixture();
        let mut registry = MemoryRegistry::new();
        let controller = RecordingController::default();

        let mut descriptor = bear_descriptor(&fx.upstream, false);
        descriptor.dependencies = ["sh", "surely-not-a-real-tool-xyz", "bear_backup"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        registry
            .record(InstalledPackage {
                name: "bear_backup".to_string(),
                descriptor: descriptor.clone(),
                revision: None,
                files: Vec::new(),
                service_file: None,
                installed_at: Utc::now(),
            })
            .expect("record");

        let pipeline = Pipeline::new(&fx.config, &mut registry, &controller);
        assert_eq!(
            pipeline.missing_dependencies(&descriptor).expect("deps"),
            vec!["surely-not-a-real-tool-xyz".to_string()]
        );
    }
}
