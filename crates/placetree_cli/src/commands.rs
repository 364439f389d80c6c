//! Subcommand execution against one SQLite database.

use crate::cli::{Cli, Commands, PlaceCommands, TagCommands};
use log::info;
use placetree_core::{
    import_tree, open_db, ClassificationNode, ClassificationRepoError, ClassificationRepository,
    DbError, ImportError, ImportRequest, NewPlace, NodeContent, PlaceLookup, PlaceRepoError,
    PlaceRepository, PlaceService, PlaceServiceError, SqliteClassificationRepository,
    SqlitePlaceRepository, TreeEntry, TreeError, TreeService,
};
use serde_json::{json, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

#[derive(Debug)]
pub enum CliError {
    Db(DbError),
    Read { path: PathBuf, source: std::io::Error },
    Description { path: PathBuf, source: serde_json::Error },
    Output(serde_json::Error),
    Place(PlaceServiceError),
    Tree(TreeError),
    Import(ImportError),
}

impl Display for CliError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "database error: {err}"),
            Self::Read { path, .. } => write!(f, "cannot read {}", path.display()),
            Self::Description { path, .. } => {
                write!(f, "invalid tree description in {}", path.display())
            }
            Self::Output(err) => write!(f, "cannot encode output: {err}"),
            Self::Place(err) => write!(f, "{err}"),
            Self::Tree(err) => write!(f, "{err}"),
            Self::Import(err) => write!(f, "import failed: {err}"),
        }
    }
}

impl Error for CliError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Read { source, .. } => Some(source),
            Self::Description { source, .. } => Some(source),
            Self::Output(err) => Some(err),
            Self::Place(err) => err.source(),
            Self::Tree(err) => err.source(),
            Self::Import(err) => err.source(),
        }
    }
}

impl From<DbError> for CliError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<PlaceServiceError> for CliError {
    fn from(value: PlaceServiceError) -> Self {
        Self::Place(value)
    }
}

impl From<PlaceRepoError> for CliError {
    fn from(value: PlaceRepoError) -> Self {
        Self::Place(value.into())
    }
}

impl From<TreeError> for CliError {
    fn from(value: TreeError) -> Self {
        Self::Tree(value)
    }
}

impl From<ClassificationRepoError> for CliError {
    fn from(value: ClassificationRepoError) -> Self {
        Self::Tree(value.into())
    }
}

impl From<ImportError> for CliError {
    fn from(value: ImportError) -> Self {
        Self::Import(value)
    }
}

impl From<serde_json::Error> for CliError {
    fn from(value: serde_json::Error) -> Self {
        Self::Output(value)
    }
}

/// Opens the database named by `cli.db` and runs the selected subcommand.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    let conn = open_db(&cli.db)?;
    let tree = TreeService::new(
        SqliteClassificationRepository::try_new(&conn)?,
        PlaceService::new(SqlitePlaceRepository::try_new(&conn)?),
    );
    let out = Printer { json: cli.json };

    match &cli.command {
        Commands::Place { command } => run_place(tree.places(), command, out),
        Commands::Tag { command } => run_tag(&tree, command, out),
        Commands::Import {
            tag,
            place_slug,
            file,
            dry_run,
        } => {
            let raw = std::fs::read_to_string(file).map_err(|source| CliError::Read {
                path: file.clone(),
                source,
            })?;
            let entries: Vec<TreeEntry> =
                serde_json::from_str(&raw).map_err(|source| CliError::Description {
                    path: file.clone(),
                    source,
                })?;
            let report = import_tree(
                &tree,
                &ImportRequest {
                    tag,
                    under_place: place_slug.as_deref(),
                    entries: &entries,
                    dry_run: *dry_run,
                },
            )?;
            info!(
                "event=cli_import module=cli status=ok tag={} file={} nodes={}",
                report.tag,
                file.display(),
                report.nodes
            );
            out.emit(
                json!({
                    "tag": report.tag,
                    "nodes": report.nodes,
                    "aliases": report.aliases,
                    "max_depth": report.max_depth,
                    "dry_run": report.dry_run,
                }),
                || {
                    let verb = if report.dry_run { "would create" } else { "created" };
                    format!(
                        "{verb} {} nodes ({} aliases, depth {}) in {}",
                        report.nodes, report.aliases, report.max_depth, report.tag
                    )
                },
            )
        }
        Commands::Resolve { place, tag, one } => {
            let nodes = if *one {
                vec![tree.resolve_one(place, tag)?]
            } else {
                tree.resolve(place, tag)?
            };
            let mut lines = Vec::with_capacity(nodes.len());
            for node in &nodes {
                lines.push(format!("{}\t{}", node.node_uuid, describe(&tree, node)?));
            }
            out.emit(serde_json::to_value(&nodes)?, || lines.join("\n"))
        }
        Commands::Maintain { tag } => {
            let tags = match tag {
                Some(tag) => vec![tree.get_tag(tag)?.slug],
                None => tree
                    .list_tags()?
                    .into_iter()
                    .map(|tag| tag.slug)
                    .collect(),
            };
            let mut reports = Vec::with_capacity(tags.len());
            for tag in &tags {
                reports.push(tree.maintain_used_trees(tag)?);
            }
            let data = reports
                .iter()
                .map(|report| {
                    json!({
                        "tag": report.tag,
                        "added": report.added,
                        "removed": report.removed,
                    })
                })
                .collect::<Vec<_>>();
            out.emit(Value::Array(data), || {
                reports
                    .iter()
                    .map(|report| {
                        format!(
                            "{}\tadded=[{}]\tremoved=[{}]",
                            report.tag,
                            report.added.join(","),
                            report.removed.join(",")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        Commands::Show { tag } => {
            let mut rows = Vec::new();
            for root in tree.get_roots(tag)? {
                collect_rows(&tree, root, 0, &mut rows)?;
            }
            let data = rows
                .iter()
                .map(|(depth, node, label)| {
                    json!({ "depth": depth, "node": node, "label": label })
                })
                .collect::<Vec<_>>();
            out.emit(Value::Array(data), || {
                rows.iter()
                    .map(|(depth, _, label)| format!("{}{}", "  ".repeat(*depth), label))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
    }
}

fn run_place<R: PlaceRepository>(
    places: &PlaceService<R>,
    command: &PlaceCommands,
    out: Printer,
) -> Result<(), CliError> {
    match command {
        PlaceCommands::AddType {
            slug,
            name,
            description,
        } => {
            let place_type = places.create_place_type(slug, name, description.as_deref())?;
            out.emit(serde_json::to_value(&place_type)?, || {
                format!("place type {} created", place_type.slug)
            })
        }
        PlaceCommands::Add {
            slug,
            name,
            place_type,
            inhabitants,
            start_date,
            end_date,
        } => {
            let place = places.create_place(NewPlace {
                inhabitants: *inhabitants,
                start_date: start_date.clone(),
                end_date: end_date.clone(),
                ..NewPlace::new(slug.as_str(), name.as_str(), place_type.as_str())
            })?;
            out.emit(serde_json::to_value(&place)?, || {
                format!("place {} created", place.slug)
            })
        }
        PlaceCommands::Show { slug } => {
            let place = places.lookup_place(slug)?;
            let identifiers = places.list_place_identifiers(&place.slug)?;
            out.emit(
                json!({ "place": place, "identifiers": identifiers }),
                || {
                    let mut lines = vec![
                        format!("slug: {}", place.slug),
                        format!("name: {}", place.name),
                        format!("type: {}", place.place_type),
                    ];
                    if let Some(inhabitants) = place.inhabitants {
                        lines.push(format!("inhabitants: {inhabitants}"));
                    }
                    if !place.successors.is_empty() {
                        lines.push(format!("successors: {}", place.successors.join(", ")));
                    }
                    for item in &identifiers {
                        lines.push(format!("{}: {}", item.identifier_slug, item.value));
                    }
                    lines.join("\n")
                },
            )
        }
        PlaceCommands::Find { external_id } => {
            let found = places.find_by_external_id(external_id)?;
            out.emit(serde_json::to_value(&found)?, || {
                found
                    .iter()
                    .map(|place| format!("{}\t{}", place.slug, place.name))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
    }
}

fn run_tag<R, P>(
    tree: &TreeService<R, P>,
    command: &TagCommands,
    out: Printer,
) -> Result<(), CliError>
where
    R: ClassificationRepository,
    P: PlaceLookup,
{
    match command {
        TagCommands::Add {
            slug,
            label,
            description,
        } => {
            let tag = tree.create_tag(slug, label, description.as_deref())?;
            out.emit(serde_json::to_value(&tag)?, || format!("tag {} created", tag.slug))
        }
        TagCommands::List => {
            let mut rows = Vec::new();
            for tag in tree.list_tags()? {
                let used = tree.used_trees(&tag.slug)?;
                rows.push((tag, used));
            }
            let data = rows
                .iter()
                .map(|(tag, used)| {
                    json!({
                        "slug": tag.slug,
                        "label": tag.label,
                        "description": tag.description,
                        "used_trees": used,
                    })
                })
                .collect::<Vec<_>>();
            out.emit(Value::Array(data), || {
                rows.iter()
                    .map(|(tag, used)| format!("{}\t{}\tuses=[{}]", tag.slug, tag.label, used.join(",")))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
    }
}

fn collect_rows<R, P>(
    tree: &TreeService<R, P>,
    node: ClassificationNode,
    depth: usize,
    rows: &mut Vec<(usize, ClassificationNode, String)>,
) -> Result<(), CliError>
where
    R: ClassificationRepository,
    P: PlaceLookup,
{
    let children = tree.get_children(node.node_uuid)?;
    let label = describe(tree, &node)?;
    rows.push((depth, node, label));
    for child in children {
        collect_rows(tree, child, depth + 1, rows)?;
    }
    Ok(())
}

/// Human label: the place slug, with the alias target's tag for aliases.
fn describe<R, P>(tree: &TreeService<R, P>, node: &ClassificationNode) -> Result<String, CliError>
where
    R: ClassificationRepository,
    P: PlaceLookup,
{
    let place = tree.reference_place_slug(node.node_uuid)?;
    match &node.content {
        NodeContent::Direct(_) => Ok(place),
        NodeContent::Alias(target) => {
            let target = tree.get_node(*target)?;
            Ok(format!("{place}>{}", target.tag))
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Printer {
    json: bool,
}

impl Printer {
    fn emit(self, data: Value, text: impl FnOnce() -> String) -> Result<(), CliError> {
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "ok": true, "data": data }))?
            );
        } else {
            let text = text();
            if !text.is_empty() {
                println!("{text}");
            }
        }
        Ok(())
    }
}
