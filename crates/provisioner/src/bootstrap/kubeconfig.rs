/// kubeconfig 合并
///
/// 控制节点上取回的 admin.conf 使用 kubeadm 的默认名称（kubernetes、kubernetes-admin），
/// 合并前改名为 `<集群>` 与 `<集群>-admin`，server 改写为控制节点地址，再写入本地汇总文件。
/// 汇总文件中与新集群同名的条目被覆盖，其他条目原样保留。

use common::{Error, Result};
use serde_yaml::{Mapping, Value};
use std::path::Path;
use tracing::info;

const SECTIONS: &[&str] = &["clusters", "users", "contexts"];

/// 把 admin.conf 改名为集群专属名称，并把 API 地址替换为 server
pub fn rename_admin_conf(admin_conf: &str, cluster: &str, server: &str) -> Result<Value> {
    let mut doc: Value = serde_yaml::from_str(admin_conf)?;
    let user = format!("{}-admin", cluster);

    let first = |doc: &Value, section: &str, field: &str| -> Result<Value> {
        doc.get(section)
            .and_then(Value::as_sequence)
            .and_then(|s| s.first())
            .and_then(|entry| entry.get(field))
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("admin.conf 缺少 {}", section)))
    };
    let mut cluster_body = first(&doc, "clusters", "cluster")?;
    cluster_body
        .as_mapping_mut()
        .ok_or_else(|| Error::InvalidArgument("admin.conf 的 cluster 不是映射".to_string()))?
        .insert("server".into(), server.into());
    let user_body = first(&doc, "users", "user")?;

    let mut context = Mapping::new();
    context.insert("cluster".into(), cluster.into());
    context.insert("user".into(), user.clone().into());

    let map = doc
        .as_mapping_mut()
        .ok_or_else(|| Error::InvalidArgument("admin.conf 不是 YAML 映射".to_string()))?;
    map.insert("clusters".into(), Value::Sequence(vec![named(cluster, "cluster", cluster_body)]));
    map.insert("users".into(), Value::Sequence(vec![named(&user, "user", user_body)]));
    map.insert(
        "contexts".into(),
        Value::Sequence(vec![named(cluster, "context", Value::Mapping(context))]),
    );
    map.insert("current-context".into(), cluster.into());
    Ok(doc)
}

fn named(name: &str, key: &str, body: Value) -> Value {
    let mut entry = Mapping::new();
    entry.insert("name".into(), name.into());
    entry.insert(key.into(), body);
    Value::Mapping(entry)
}

fn entry_name(entry: &Value) -> Option<&str> {
    entry.get("name").and_then(Value::as_str)
}

/// 合并到已有的 kubeconfig 内容，existing 为 None 时以新配置为准
pub fn merge(existing: Option<&str>, incoming: &Value) -> Result<String> {
    let mut base: Value = match existing {
        Some(text) if !text.trim().is_empty() => serde_yaml::from_str(text)?,
        _ => {
            let mut empty = Mapping::new();
            empty.insert("apiVersion".into(), "v1".into());
            empty.insert("kind".into(), "Config".into());
            Value::Mapping(empty)
        }
    };
    let base_map = base
        .as_mapping_mut()
        .ok_or_else(|| Error::InvalidArgument("kubeconfig 不是 YAML 映射".to_string()))?;

    for section in SECTIONS {
        let new_entries: Vec<Value> = incoming
            .get(*section)
            .and_then(Value::as_sequence)
            .cloned()
            .unwrap_or_default();
        let new_names: Vec<&str> = new_entries.iter().filter_map(entry_name).collect();

        let mut merged: Vec<Value> = base_map
            .get(*section)
            .and_then(Value::as_sequence)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| !entry_name(e).is_some_and(|n| new_names.contains(&n)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        merged.extend(new_entries.iter().cloned());
        base_map.insert((*section).into(), Value::Sequence(merged));
    }

    let has_current = base_map
        .get("current-context")
        .and_then(Value::as_str)
        .is_some_and(|s| !s.is_empty());
    if !has_current {
        if let Some(current) = incoming.get("current-context") {
            base_map.insert("current-context".into(), current.clone());
        }
    }

    Ok(serde_yaml::to_string(&base)?)
}

/// 改名并合并进本地 kubeconfig 文件
pub async fn merge_into_file(path: &Path, admin_conf: &str, cluster: &str, server: &str) -> Result<()> {
    let incoming = rename_admin_conf(admin_conf, cluster, server)?;
    let existing = match tokio::fs::read_to_string(path).await {
        Ok(s) => Some(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };
    let merged = merge(existing.as_deref(), &incoming)?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, merged).await?;
    info!("📝 已将集群 {} 的凭据合并到 {}", cluster, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADMIN_CONF: &str = r#"
apiVersion: v1
kind: Config
clusters:
- cluster:
    certificate-authority-data: Q0E=
    server: https://c-instance-0.demo.local:6443
  name: kubernetes
contexts:
- context:
    cluster: kubernetes
    user: kubernetes-admin
  name: kubernetes-admin@kubernetes
current-context: kubernetes-admin@kubernetes
users:
- name: kubernetes-admin
  user:
    client-certificate-data: Q0VSVA==
    client-key-data: S0VZ
"#;

    const EXISTING: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: prod
  cluster:
    server: https://prod:6443
- name: demo
  cluster:
    server: https://stale:6443
contexts:
- name: prod
  context:
    cluster: prod
    user: prod-admin
users:
- name: prod-admin
  user:
    token: abc
current-context: prod
"#;

    fn names(doc: &Value, section: &str) -> Vec<String> {
        doc[section]
            .as_sequence()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap().to_string())
            .collect()
    }

    const SERVER: &str = "https://192.168.66.10:6443";

    #[test]
    fn test_rename_admin_conf() {
        let doc = rename_admin_conf(ADMIN_CONF, "demo", SERVER).unwrap();
        assert_eq!(names(&doc, "clusters"), vec!["demo"]);
        assert_eq!(names(&doc, "users"), vec!["demo-admin"]);
        assert_eq!(names(&doc, "contexts"), vec!["demo"]);
        assert_eq!(doc["contexts"][0]["context"]["user"].as_str(), Some("demo-admin"));
        assert_eq!(doc["clusters"][0]["cluster"]["server"].as_str(), Some(SERVER));
        // 其余字段保持不变
        assert_eq!(
            doc["clusters"][0]["cluster"]["certificate-authority-data"].as_str(),
            Some("Q0E=")
        );
        assert_eq!(doc["current-context"].as_str(), Some("demo"));
    }

    #[test]
    fn test_merge_preserves_unrelated_entries() {
        let incoming = rename_admin_conf(ADMIN_CONF, "demo", SERVER).unwrap();
        let merged: Value = serde_yaml::from_str(&merge(Some(EXISTING), &incoming).unwrap()).unwrap();

        assert_eq!(names(&merged, "clusters"), vec!["prod", "demo"]);
        assert_eq!(names(&merged, "users"), vec!["prod-admin", "demo-admin"]);
        assert_eq!(names(&merged, "contexts"), vec!["prod", "demo"]);
        // 同名条目被覆盖
        assert_eq!(merged["clusters"][1]["cluster"]["server"].as_str(), Some(SERVER));
        assert_eq!(merged["current-context"].as_str(), Some("prod"));
    }

    #[test]
    fn test_merge_into_empty() {
        let incoming = rename_admin_conf(ADMIN_CONF, "demo", SERVER).unwrap();
        let merged: Value = serde_yaml::from_str(&merge(None, &incoming).unwrap()).unwrap();
        assert_eq!(names(&merged, "clusters"), vec!["demo"]);
        assert_eq!(merged["current-context"].as_str(), Some("demo"));
    }

    #[test]
    fn test_garbage_admin_conf_is_rejected() {
        assert!(rename_admin_conf("just a string", "demo", SERVER).is_err());
        assert!(rename_admin_conf("clusters: []\nusers: []\n", "demo", SERVER).is_err());
    }

    #[tokio::test]
    async fn test_merge_into_file_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".kube").join("config");
        merge_into_file(&path, ADMIN_CONF, "demo", SERVER).await.unwrap();
        merge_into_file(&path, ADMIN_CONF, "demo", SERVER).await.unwrap();

        let doc: Value = serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(names(&doc, "clusters"), vec!["demo"]);
    }
}
