/// Kubernetes 引导
///
/// 阶段之间严格串行，阶段内部按节点并发：
/// - A：所有节点准备系统、写 /etc/hosts，控制节点额外预拉镜像；全部结束后才进入 B
/// - B：依次尝试控制节点，第一个成功完成 init、取得 join 命令和 admin.conf 的即停止
/// - C：所有工作节点执行 join 命令
/// - 最后把 admin.conf 合并进本地 kubeconfig
///
/// 单个节点失败只记录并放弃该节点，同阶段其他节点继续执行。
/// 取消只阻止下发新的命令，已经在执行的远程命令不会被中断。

use common::models::{Cluster, Instance, Role};
use common::utils::Ipv4Cidr;
use common::{Error, Result};
use futures::future::join_all;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::commands;
use super::kubeconfig;
use crate::ssh::RemoteExecutor;

/// 引导过程中的临时状态，不做持久化
#[derive(Debug, Default)]
pub struct BootstrapState {
    /// 完成阶段 A 的节点
    pub prepared: HashSet<String>,
    pub join_token: Option<String>,
    pub admin_conf: Option<String>,
}

/// 引导结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub control_plane: String,
    pub admin_conf_path: PathBuf,
    pub joined: Vec<String>,
    /// (节点名, 错误信息)
    pub failures: Vec<(String, String)>,
}

impl BootstrapReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// 集群网段参数
#[derive(Debug, Clone, Copy)]
pub struct ClusterCidrs {
    pub pod: Ipv4Cidr,
    pub service: Ipv4Cidr,
}

pub struct RemoteBootstrapper {
    executor: Arc<dyn RemoteExecutor>,
    state_dir: PathBuf,
    kubeconfig: PathBuf,
}

impl RemoteBootstrapper {
    pub fn new(executor: Arc<dyn RemoteExecutor>, state_dir: PathBuf, kubeconfig: PathBuf) -> Self {
        Self {
            executor,
            state_dir,
            kubeconfig,
        }
    }

    pub fn admin_conf_path(&self, cluster: &str) -> PathBuf {
        self.state_dir.join(cluster).join("admin.conf")
    }

    pub async fn bootstrap(
        &self,
        cluster: &Cluster,
        cidrs: ClusterCidrs,
        cancel: &CancellationToken,
    ) -> Result<BootstrapReport> {
        if cluster.controllers().next().is_none() {
            return Err(Error::InvalidArgument(format!("集群 {} 没有控制节点", cluster.name)));
        }
        // 所有节点都需要地址才能生成 /etc/hosts
        let hosts = commands::hosts_entries(cluster)?;

        let mut state = BootstrapState::default();
        let mut failures: Vec<(String, String)> = Vec::new();

        // ---- 阶段 A ----
        check_cancelled(cancel, "阶段 A")?;
        info!(phase = "A", cluster = %cluster.name, "🔧 准备 {} 个节点", cluster.instances.len());
        let batches: Vec<(Instance, Vec<String>)> = cluster
            .instances
            .iter()
            .map(|instance| {
                let mut cmds = commands::ubuntu_prep();
                cmds.extend(hosts.iter().cloned());
                if instance.role == Role::Controller {
                    cmds.extend(commands::image_pull());
                }
                (instance.clone(), cmds)
            })
            .collect();
        for (name, result) in self.run_parallel("A", batches).await {
            match result {
                Ok(_) => {
                    state.prepared.insert(name);
                }
                Err(e) => failures.push((name, e.to_string())),
            }
        }

        // ---- 阶段 B ----
        check_cancelled(cancel, "阶段 B")?;
        let mut control_plane = None;
        for controller in cluster.controllers() {
            if !state.prepared.contains(&controller.name) {
                continue;
            }
            check_cancelled(cancel, "阶段 B")?;
            match self.init_control_plane(controller, cidrs).await {
                Ok((token, admin_conf)) => {
                    state.join_token = Some(token);
                    state.admin_conf = Some(admin_conf);
                    control_plane = Some(controller);
                    break;
                }
                Err(e) => {
                    error!(phase = "B", node = %controller.name, "❌ 控制平面初始化失败: {}", e);
                    failures.push((controller.name.clone(), e.to_string()));
                }
            }
        }
        let (Some(control_plane), Some(token), Some(admin_conf)) =
            (control_plane, state.join_token.clone(), state.admin_conf.clone())
        else {
            return Err(Error::RemoteCommand(format!(
                "集群 {} 没有控制节点完成初始化，未取得 join 命令",
                cluster.name
            )));
        };

        let admin_conf_path = self.admin_conf_path(&cluster.name);
        if let Some(parent) = admin_conf_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&admin_conf_path, &admin_conf).await?;
        info!(phase = "B", "🔐 admin.conf 已保存到 {}", admin_conf_path.display());

        // ---- 阶段 C ----
        check_cancelled(cancel, "阶段 C")?;
        let batches: Vec<(Instance, Vec<String>)> = cluster
            .workers()
            .filter(|w| state.prepared.contains(&w.name))
            .map(|w| (w.clone(), vec![token.clone()]))
            .collect();
        let mut joined = Vec::new();
        for (name, result) in self.run_parallel("C", batches).await {
            match result {
                Ok(_) => joined.push(name),
                Err(e) => failures.push((name, e.to_string())),
            }
        }

        // ---- 合并凭据 ----
        // 本地不一定能解析实例 FQDN，改用控制节点地址访问 API
        let server = format!("https://{}:{}", commands::require_ip(control_plane)?, commands::API_PORT);
        kubeconfig::merge_into_file(&self.kubeconfig, &admin_conf, &cluster.name, &server).await?;

        if failures.is_empty() {
            info!("✅ 集群 {} 引导完成", cluster.name);
        } else {
            warn!("⚠️ 集群 {} 引导完成，{} 个节点失败", cluster.name, failures.len());
        }
        Ok(BootstrapReport {
            control_plane: control_plane.name.clone(),
            admin_conf_path,
            joined,
            failures,
        })
    }

    /// 初始化控制平面，返回 (join 命令, admin.conf)
    async fn init_control_plane(&self, controller: &Instance, cidrs: ClusterCidrs) -> Result<(String, String)> {
        let host = commands::require_ip(controller)?.to_string();
        let endpoint = format!("{}:{}", controller.name, commands::API_PORT);
        info!(phase = "B", node = %controller.name, "🎛️ kubeadm init (pod: {}, service: {})", cidrs.pod, cidrs.service);

        self.executor
            .run(&host, &commands::kubeadm_init(&cidrs.pod, &cidrs.service, &endpoint))
            .await?;

        let token = commands::clean_token(&self.executor.run(&host, &commands::token_create()).await?);
        if token.trim().is_empty() {
            return Err(Error::RemoteCommand(format!("{} 未返回 join 命令", controller.name)));
        }

        let admin_conf = self.executor.run(&host, &commands::fetch_admin_conf()).await?;
        Ok((token, admin_conf))
    }

    /// 每个节点一个任务并发执行，等待全部结束，结果按输入顺序返回
    async fn run_parallel(
        &self,
        phase: &'static str,
        batches: Vec<(Instance, Vec<String>)>,
    ) -> Vec<(String, Result<String>)> {
        let tasks: Vec<_> = batches
            .into_iter()
            .map(|(instance, cmds)| {
                let executor = self.executor.clone();
                let name = instance.name.clone();
                let handle = tokio::spawn(async move {
                    let host = commands::require_ip(&instance)?.to_string();
                    executor.run(&host, &cmds).await
                });
                (name, handle)
            })
            .collect();

        let (names, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        let results = join_all(handles).await;

        names
            .into_iter()
            .zip(results)
            .map(|(name, joined)| {
                let result = joined
                    .map_err(|e| Error::Internal(format!("节点 {} 的任务异常退出: {}", name, e)))
                    .and_then(|r| r);
                match &result {
                    Ok(_) => info!(phase, node = %name, "✅ 完成"),
                    Err(e) => error!(phase, node = %name, "❌ 失败: {}", e),
                }
                (name, result)
            })
            .collect()
    }
}

fn check_cancelled(cancel: &CancellationToken, phase: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled(format!("引导{}前被中止", phase)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeExecutor;
    use std::net::Ipv4Addr;

    const JOIN: &str = "kubeadm join c-instance-0.demo.local:6443 --token abc.def --discovery-token-ca-cert-hash sha256:00";
    const ADMIN_CONF: &str = "apiVersion: v1\nkind: Config\nclusters:\n- name: kubernetes\n  cluster:\n    server: https://c:6443\nusers:\n- name: kubernetes-admin\n  user:\n    token: t\ncontexts: []\n";

    fn cluster(controllers: u32, workers: u32) -> Cluster {
        let mut instances = Vec::new();
        let mut ip = 10u8;
        for (role, count) in [(Role::Controller, controllers), (Role::Worker, workers)] {
            for i in 0..count {
                let mut inst = Instance::planned(role, i, "demo", "local");
                inst.ip_addresses = vec![Ipv4Addr::new(192, 168, 66, ip)];
                ip += 1;
                instances.push(inst);
            }
        }
        Cluster { name: "demo".into(), instances }
    }

    fn cidrs() -> ClusterCidrs {
        ClusterCidrs {
            pod: "10.32.0.0/16".parse().unwrap(),
            service: "10.96.0.0/16".parse().unwrap(),
        }
    }

    fn executor() -> Arc<FakeExecutor> {
        let exec = Arc::new(FakeExecutor::new());
        exec.respond("kubeadm token create", &format!("{}\r\n", JOIN));
        exec.respond("cat /etc/kubernetes/admin.conf", ADMIN_CONF);
        exec
    }

    fn bootstrapper(exec: Arc<FakeExecutor>, dir: &std::path::Path) -> RemoteBootstrapper {
        RemoteBootstrapper::new(exec, dir.join("state"), dir.join("kubeconfig"))
    }

    #[tokio::test]
    async fn test_phases_run_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor();
        let b = bootstrapper(exec.clone(), dir.path());

        let report = b.bootstrap(&cluster(1, 2), cidrs(), &CancellationToken::new()).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.control_plane, "c-instance-0.demo.local");
        assert_eq!(report.joined.len(), 2);

        let events = exec.events();
        let last_prep = events.iter().rposition(|e| e.script.contains("swapoff -a")).unwrap();
        let init = events.iter().position(|e| e.script.contains("kubeadm init")).unwrap();
        let token = events.iter().position(|e| e.script.contains("kubeadm token create")).unwrap();
        let first_join = events.iter().position(|e| e.script.starts_with("kubeadm join")).unwrap();

        assert_eq!(events.iter().filter(|e| e.script.contains("swapoff -a")).count(), 3);
        assert!(last_prep < init);
        assert!(init < token);
        assert!(token < first_join);

        // join 命令已去掉末尾的回车换行
        let joins: Vec<_> = events.iter().filter(|e| e.script.starts_with("kubeadm join")).collect();
        assert_eq!(joins.len(), 2);
        assert!(joins.iter().all(|e| e.script == JOIN));
        assert!(joins.iter().all(|e| e.host != "192.168.66.10"));

        // 只有控制节点预拉镜像
        let pulls: Vec<_> = events.iter().filter(|e| e.script.contains("images pull")).collect();
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0].host, "192.168.66.10");

        assert!(report.admin_conf_path.exists());
        let kubeconfig = std::fs::read_to_string(dir.path().join("kubeconfig")).unwrap();
        assert!(kubeconfig.contains("demo-admin"));
        let doc: serde_yaml::Value = serde_yaml::from_str(&kubeconfig).unwrap();
        assert_eq!(
            doc["clusters"][0]["cluster"]["server"].as_str(),
            Some("https://192.168.66.10:6443")
        );
    }

    #[tokio::test]
    async fn test_no_join_without_token() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(FakeExecutor::new());
        exec.respond("kubeadm token create", "\r\n");
        let b = bootstrapper(exec.clone(), dir.path());

        let err = b.bootstrap(&cluster(1, 2), cidrs(), &CancellationToken::new()).await;

        assert!(matches!(err, Err(Error::RemoteCommand(_))));
        assert!(exec.events().iter().all(|e| !e.script.starts_with("kubeadm join")));
        assert!(!dir.path().join("kubeconfig").exists());
    }

    #[tokio::test]
    async fn test_first_controller_wins() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor();
        exec.fail_on("192.168.66.10", "kubeadm init", "port 6443 in use");
        let b = bootstrapper(exec.clone(), dir.path());

        let report = b.bootstrap(&cluster(3, 1), cidrs(), &CancellationToken::new()).await.unwrap();

        assert_eq!(report.control_plane, "c-instance-1.demo.local");
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "c-instance-0.demo.local");
        // 第三个控制节点不再尝试
        let inits: Vec<_> = exec
            .events()
            .into_iter()
            .filter(|e| e.script.contains("kubeadm init"))
            .map(|e| e.host)
            .collect();
        assert_eq!(inits, vec!["192.168.66.10", "192.168.66.11"]);

        // 凭据指向实际完成初始化的控制节点
        let kubeconfig = std::fs::read_to_string(dir.path().join("kubeconfig")).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&kubeconfig).unwrap();
        assert_eq!(
            doc["clusters"][0]["cluster"]["server"].as_str(),
            Some("https://192.168.66.11:6443")
        );
    }

    #[tokio::test]
    async fn test_prep_failure_skips_node_only() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor();
        exec.fail_on("192.168.66.12", "swapoff", "apt lock held");
        let b = bootstrapper(exec.clone(), dir.path());

        let report = b.bootstrap(&cluster(1, 2), cidrs(), &CancellationToken::new()).await.unwrap();

        assert!(!report.is_complete());
        assert_eq!(report.joined, vec!["w-instance-0.demo.local".to_string()]);
        let joins: Vec<_> = exec
            .events()
            .into_iter()
            .filter(|e| e.script.starts_with("kubeadm join"))
            .map(|e| e.host)
            .collect();
        assert_eq!(joins, vec!["192.168.66.11"]);
    }

    #[tokio::test]
    async fn test_missing_address_fails_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor();
        let mut c = cluster(1, 1);
        c.instances[1].ip_addresses.clear();
        let b = bootstrapper(exec.clone(), dir.path());

        let err = b.bootstrap(&c, cidrs(), &CancellationToken::new()).await;
        assert!(matches!(err, Err(Error::InvalidArgument(_))));
        assert!(exec.events().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_stops_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let b = bootstrapper(exec.clone(), dir.path());

        let err = b.bootstrap(&cluster(1, 1), cidrs(), &cancel).await;
        assert!(matches!(err, Err(Error::Cancelled(_))));
        assert!(exec.events().is_empty());
    }
}
