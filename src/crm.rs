//! In-memory CRM toolkit: customers, card products, and tasks for one
//! relationship manager's book.
//!
//! Search tools answer with a `message` the model can relay: zero matches
//! ask back for different information, multiple matches ask back for the
//! most discriminating field. The two mutating tools only validate their
//! input; when everything checks out they answer `ask_confirmation: true`
//! and the actual write happens through the privileged `apply_*`
//! counterparts after the human approves.

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use indoc::indoc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::errors::{AgentError, AgentResult};
use crate::models::tool::{Tool, ToolCall};
use crate::toolkit::Toolkit;

pub const CREATE_TASK_TOOL: &str = "create_rm_task";
pub const UPDATE_TASK_TOOL: &str = "update_rm_task";
pub const APPLY_CREATE_TASK_TOOL: &str = "apply_create_rm_task";
pub const APPLY_UPDATE_TASK_TOOL: &str = "apply_update_rm_task";

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Call,
    Email,
    Meeting,
    FollowUp,
    SendInfoPackage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Completed,
    InProgress,
}

impl TaskStatus {
    fn report_key(&self) -> &'static str {
        match self {
            TaskStatus::Completed => "completed tasks",
            TaskStatus::InProgress => "in_progress tasks",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Segment {
    #[serde(rename = "Diamond Elite")]
    DiamondElite,
    #[serde(rename = "Diamond")]
    Diamond,
    #[serde(rename = "Pre-Diamond")]
    PreDiamond,
    #[serde(rename = "Champion Prime")]
    ChampionPrime,
    #[serde(rename = "Rising Prime")]
    RisingPrime,
    #[serde(rename = "Uppermega Prime")]
    UppermegaPrime,
    #[serde(rename = "Mega Prime")]
    MegaPrime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardType {
    Debit,
    Credit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardNetwork {
    Visa,
    Mastercard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipManager {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: i64,
    pub rm_id: i64,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub gender: Gender,
    pub job_title: String,
    pub segment: Segment,
    pub state: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardProduct {
    pub id: i64,
    pub card_type: CardType,
    pub card_product_name: String,
    pub card_description: String,
    pub target_description: String,
    pub card_network: CardNetwork,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RmTask {
    pub id: i64,
    pub task_id: String,
    pub rm_id: i64,
    pub customer_id: i64,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub task_details: String,
    pub due_date: NaiveDate,
    pub created_at: NaiveDate,
}

/// Shared backing data, one instance across every session's toolkit
#[derive(Default)]
pub struct CrmStore {
    rms: Mutex<Vec<RelationshipManager>>,
    customers: Mutex<Vec<Customer>>,
    cards: Mutex<Vec<CardProduct>>,
    tasks: Mutex<Vec<RmTask>>,
}

impl CrmStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A small seeded book used by the examples and the scenario tests
    pub fn sample() -> Self {
        let store = Self::new();
        {
            let mut rms = store.rms.lock().unwrap();
            rms.push(RelationshipManager {
                id: 1,
                name: "Nguyễn Văn An".into(),
            });
            rms.push(RelationshipManager {
                id: 2,
                name: "Đỗ Thanh Mai".into(),
            });
        }
        {
            let mut customers = store.customers.lock().unwrap();
            customers.extend([
                Customer {
                    id: 1,
                    rm_id: 1,
                    name: "Phạm Thu Hà".into(),
                    email: "ha.pham@example.vn".into(),
                    phone: "+84912000001".into(),
                    gender: Gender::Female,
                    job_title: "Kế toán".into(),
                    segment: Segment::RisingPrime,
                    state: "Hà Nội".into(),
                    is_active: true,
                },
                Customer {
                    id: 2,
                    rm_id: 1,
                    name: "Trần Quốc Thắng".into(),
                    email: "thang.tran@example.vn".into(),
                    phone: "+84912000002".into(),
                    gender: Gender::Male,
                    job_title: "Kỹ sư".into(),
                    segment: Segment::Diamond,
                    state: "Hà Nội".into(),
                    is_active: true,
                },
                Customer {
                    id: 3,
                    rm_id: 1,
                    name: "Lê Minh Thắng".into(),
                    email: "thang.le@example.vn".into(),
                    phone: "+84912000003".into(),
                    gender: Gender::Male,
                    job_title: "Bác sĩ".into(),
                    segment: Segment::ChampionPrime,
                    state: "Đà Nẵng".into(),
                    is_active: true,
                },
                Customer {
                    id: 4,
                    rm_id: 2,
                    name: "Hoàng Gia Bảo".into(),
                    email: "bao.hoang@example.vn".into(),
                    phone: "+84912000004".into(),
                    gender: Gender::Male,
                    job_title: "Luật sư".into(),
                    segment: Segment::MegaPrime,
                    state: "Hồ Chí Minh".into(),
                    is_active: true,
                },
                Customer {
                    id: 5,
                    rm_id: 1,
                    name: "Vũ Ngọc Linh".into(),
                    email: "linh.vu@example.vn".into(),
                    phone: "+84912000005".into(),
                    gender: Gender::Female,
                    job_title: "Giáo viên".into(),
                    segment: Segment::DiamondElite,
                    state: "Hải Phòng".into(),
                    is_active: false,
                },
            ]);
        }
        {
            let mut cards = store.cards.lock().unwrap();
            cards.extend([
                CardProduct {
                    id: 1,
                    card_type: CardType::Credit,
                    card_product_name: "Shopper Platinum".into(),
                    card_description: "Cashback on online spending, annual fee waived on spend"
                        .into(),
                    target_description: "Young professionals who shop online frequently".into(),
                    card_network: CardNetwork::Visa,
                },
                CardProduct {
                    id: 2,
                    card_type: CardType::Credit,
                    card_product_name: "Travel Miles Signature".into(),
                    card_description: "Air miles on spending, lounge access, global travel insurance"
                        .into(),
                    target_description: "Frequent business and leisure travellers".into(),
                    card_network: CardNetwork::Visa,
                },
                CardProduct {
                    id: 3,
                    card_type: CardType::Debit,
                    card_product_name: "Everyday Debit".into(),
                    card_description: "No-fee debit card with app-based spending controls".into(),
                    target_description: "Customers who want simple daily banking".into(),
                    card_network: CardNetwork::Mastercard,
                },
            ]);
        }
        {
            let mut tasks = store.tasks.lock().unwrap();
            tasks.extend([
                RmTask {
                    id: 1,
                    task_id: "TASK-SEED00000001".into(),
                    rm_id: 1,
                    customer_id: 1,
                    task_type: TaskType::Call,
                    status: TaskStatus::Completed,
                    task_details: "Quarterly review call".into(),
                    due_date: NaiveDate::from_ymd_opt(2026, 7, 10).unwrap(),
                    created_at: NaiveDate::from_ymd_opt(2026, 7, 1).unwrap(),
                },
                RmTask {
                    id: 2,
                    task_id: "TASK-SEED00000002".into(),
                    rm_id: 1,
                    customer_id: 2,
                    task_type: TaskType::Email,
                    status: TaskStatus::Completed,
                    task_details: "Send card upgrade offer".into(),
                    due_date: NaiveDate::from_ymd_opt(2026, 7, 20).unwrap(),
                    created_at: NaiveDate::from_ymd_opt(2026, 7, 12).unwrap(),
                },
                RmTask {
                    id: 3,
                    task_id: "TASK-SEED00000003".into(),
                    rm_id: 1,
                    customer_id: 3,
                    task_type: TaskType::Meeting,
                    status: TaskStatus::InProgress,
                    task_details: "Portfolio planning meeting".into(),
                    due_date: NaiveDate::from_ymd_opt(2026, 8, 15).unwrap(),
                    created_at: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
                },
                RmTask {
                    id: 4,
                    task_id: "TASK-SEED00000004".into(),
                    rm_id: 2,
                    customer_id: 4,
                    task_type: TaskType::FollowUp,
                    status: TaskStatus::InProgress,
                    task_details: "Follow up on loan enquiry".into(),
                    due_date: NaiveDate::from_ymd_opt(2026, 8, 18).unwrap(),
                    created_at: NaiveDate::from_ymd_opt(2026, 8, 3).unwrap(),
                },
            ]);
        }
        store
    }

    /// Snapshot of one RM's tasks, mainly for assertions and reporting
    pub fn tasks_for(&self, rm_id: i64) -> Vec<RmTask> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|task| task.rm_id == rm_id)
            .cloned()
            .collect()
    }
}

/// The CRM capability set scoped to one authenticated RM
pub struct CrmToolkit {
    store: Arc<CrmStore>,
    rm_id: i64,
    tools: Vec<Tool>,
    privileged: Vec<Tool>,
}

impl CrmToolkit {
    pub fn new(store: Arc<CrmStore>, rm_id: i64) -> Self {
        let tools = vec![
            Tool::new(
                "find_customer",
                "Search for a customer by various criteria. Returns customer information if found, \
                 or a message asking for more specific information if multiple customers match.",
                json!({
                    "type": "object",
                    "properties": {
                        "customerName": {
                            "type": "string",
                            "description": "The customer's full name or partial name to search for"
                        },
                        "customerGender": {
                            "type": "string",
                            "enum": ["male", "female", "other"],
                            "description": "The customer's gender"
                        },
                        "customerEmail": {
                            "type": "string",
                            "description": "The customer's email address"
                        },
                        "customerPhone": {
                            "type": "string",
                            "description": "The customer's phone number in Vietnam (starts with +84)"
                        },
                        "customerJobTitle": {
                            "type": "string",
                            "description": "The customer's job title or profession (in Vietnamese)"
                        },
                        "customerSegment": {
                            "type": "string",
                            "description": "The customer's segment classification"
                        },
                        "customerState": {
                            "type": "string",
                            "description": "The customer's state or province in Vietnam"
                        }
                    }
                }),
            ),
            Tool::new(
                "find_card_product",
                "Search for a card product by various criteria. Returns card product information \
                 if found, or a message asking for more specific information if multiple products match.",
                json!({
                    "type": "object",
                    "properties": {
                        "cardType": {
                            "type": "string",
                            "enum": ["DEBIT", "CREDIT"],
                            "description": "The type of card product to search for"
                        },
                        "cardProductName": {
                            "type": "string",
                            "description": "The specific name of the card product"
                        },
                        "cardNetwork": {
                            "type": "string",
                            "enum": ["VISA", "MASTERCARD"],
                            "description": "The card network provider"
                        }
                    }
                }),
            ),
            Tool::new(
                "find_rm_task",
                "Search for a task for the relationship manager based on specified criteria. \
                 Returns task information if found, or a message asking for more specific \
                 information if multiple tasks match.",
                json!({
                    "type": "object",
                    "properties": {
                        "customerId": {
                            "type": "integer",
                            "description": "The unique identifier for a customer. If other customer \
                                            information is provided, call `find_customer` first to \
                                            obtain the `customerId`."
                        },
                        "taskType": {
                            "type": "string",
                            "enum": ["CALL", "EMAIL", "MEETING", "FOLLOW_UP", "SEND_INFO_PACKAGE"],
                            "description": "The type of task to filter by"
                        },
                        "taskStatus": {
                            "type": "string",
                            "enum": ["COMPLETED", "IN_PROGRESS"],
                            "description": "The current status of the task"
                        },
                        "taskDueDateStart": {
                            "type": "string",
                            "description": "The start date to filter tasks by due date range in YYYY-MM-DD format"
                        },
                        "taskDueDateEnd": {
                            "type": "string",
                            "description": "The end date to filter tasks by due date range in YYYY-MM-DD format"
                        }
                    }
                }),
            ),
            Tool::new(
                CREATE_TASK_TOOL,
                "Create a new task for the relationship manager, linking it to a specific \
                 customer and setting a due date.",
                json!({
                    "type": "object",
                    "required": ["customerId", "taskType", "taskStatus", "taskDueDate", "taskDetails"],
                    "properties": {
                        "customerId": {
                            "type": "integer",
                            "description": "The unique identifier for the customer the task is for. \
                                            If the user provides a name or other details, use the \
                                            `find_customer` tool first."
                        },
                        "taskType": {
                            "type": "string",
                            "enum": ["CALL", "EMAIL", "MEETING", "FOLLOW_UP", "SEND_INFO_PACKAGE"],
                            "description": "The type of task to create"
                        },
                        "taskStatus": {
                            "type": "string",
                            "enum": ["COMPLETED", "IN_PROGRESS"],
                            "description": "The initial status of the task"
                        },
                        "taskDueDate": {
                            "type": "string",
                            "description": "The specific due date for the task in YYYY-MM-DD format"
                        },
                        "taskDetails": {
                            "type": "string",
                            "description": "Detailed description of the task"
                        }
                    }
                }),
            ),
            Tool::new(
                UPDATE_TASK_TOOL,
                "Update specific fields of an existing task identified by its unique ID.",
                json!({
                    "type": "object",
                    "required": ["rmTaskId"],
                    "properties": {
                        "rmTaskId": {
                            "type": "integer",
                            "description": "The unique identifier of the task to update. If the user \
                                            refers to a task by attributes, call `find_rm_task` first \
                                            to get the `rmTaskId`."
                        },
                        "updateTaskStatus": {
                            "type": "string",
                            "enum": ["COMPLETED", "IN_PROGRESS"],
                            "description": "The new status of the task."
                        },
                        "updateTaskDueDate": {
                            "type": "string",
                            "description": "The new due date of the task in YYYY-MM-DD format."
                        },
                        "updateTaskDetails": {
                            "type": "string",
                            "description": "The new details of the task."
                        }
                    }
                }),
            ),
            Tool::new(
                "report_performance",
                "Retrieve a performance report for the relationship manager over a specified \
                 date range.",
                json!({
                    "type": "object",
                    "properties": {
                        "startDate": {
                            "type": "string",
                            "description": "The start date of the performance report in YYYY-MM-DD format."
                        },
                        "endDate": {
                            "type": "string",
                            "description": "The end date of the performance report in YYYY-MM-DD format."
                        }
                    }
                }),
            ),
        ];

        let privileged = vec![
            Tool::new(
                APPLY_CREATE_TASK_TOOL,
                "Actually create a task in the store. Only called after user approval.",
                json!({
                    "type": "object",
                    "required": ["rmId", "customerId", "taskType", "taskStatus", "taskDueDate"],
                    "properties": {
                        "rmId": {"type": "integer"},
                        "customerId": {"type": "integer"},
                        "taskType": {"type": "string"},
                        "taskStatus": {"type": "string"},
                        "taskDueDate": {"type": "string"},
                        "taskDetails": {"type": "string"}
                    }
                }),
            ),
            Tool::new(
                APPLY_UPDATE_TASK_TOOL,
                "Actually update a task in the store. Only called after user approval.",
                json!({
                    "type": "object",
                    "required": ["rmTaskId"],
                    "properties": {
                        "rmTaskId": {"type": "integer"},
                        "updateTaskStatus": {"type": "string"},
                        "updateTaskDueDate": {"type": "string"},
                        "updateTaskDetails": {"type": "string"}
                    }
                }),
            ),
        ];

        Self {
            store,
            rm_id,
            tools,
            privileged,
        }
    }

    fn find_customer(&self, args: &Value) -> Value {
        let name = arg_str(args, "customerName");
        let gender: Option<Gender> = arg_enum(args, "customerGender");
        let email = arg_str(args, "customerEmail");
        let phone = arg_str(args, "customerPhone");
        let job_title = arg_str(args, "customerJobTitle");
        let segment: Option<Segment> = arg_enum(args, "customerSegment");
        let state = arg_str(args, "customerState");

        let mut used_fields: Vec<&str> = Vec::new();
        if name.is_some() {
            used_fields.push("name");
        }
        if gender.is_some() {
            used_fields.push("gender");
        }
        if email.is_some() {
            used_fields.push("email");
        }
        if phone.is_some() {
            used_fields.push("phone");
        }
        if job_title.is_some() {
            used_fields.push("jobTitle");
        }
        if segment.is_some() {
            used_fields.push("segment");
        }
        if state.is_some() {
            used_fields.push("state");
        }

        if used_fields.is_empty() {
            return json!({
                "customer_info": {},
                "message": "No search criteria provided. Please provide at least one information \
                            (name, email, phone, job title, segment, state) to search for a customer."
            });
        }

        let customers = self.store.customers.lock().unwrap();
        let matches: Vec<&Customer> = customers
            .iter()
            .filter(|customer| customer.rm_id == self.rm_id)
            .filter(|customer| {
                contains_ci(&customer.name, &name)
                    && gender.map_or(true, |wanted| customer.gender == wanted)
                    && contains_ci(&customer.email, &email)
                    && contains_ci(&customer.phone, &phone)
                    && contains_ci(&customer.job_title, &job_title)
                    && segment.map_or(true, |wanted| customer.segment == wanted)
                    && contains_ci(&customer.state, &state)
            })
            .collect();

        if matches.is_empty() {
            return json!({
                "customer_info": {},
                "message": "No customer found matching the provided criteria. Please ask back for \
                            different information."
            });
        }

        if matches.len() > 1 {
            let field = most_discriminating(&matches, &[
                ("name", &|c: &&Customer| c.name.clone()),
                ("email", &|c: &&Customer| c.email.clone()),
                ("phone", &|c: &&Customer| c.phone.clone()),
                ("gender", &|c: &&Customer| format!("{:?}", c.gender)),
                ("jobTitle", &|c: &&Customer| c.job_title.clone()),
                ("segment", &|c: &&Customer| format!("{:?}", c.segment)),
                ("state", &|c: &&Customer| c.state.clone()),
            ]);
            let message = if used_fields.contains(&field) {
                format!(
                    "Multiple customers ({}) found matching the criteria. Please ask back for \
                     customer's full {}.",
                    matches.len(),
                    field
                )
            } else {
                format!(
                    "Multiple customers ({}) found matching the criteria. Please ask back for \
                     customer's {}.",
                    matches.len(),
                    field
                )
            };
            return json!({ "customer_info": {}, "message": message });
        }

        let customer = matches[0];
        json!({
            "customer_info": customer,
            "message": if customer.is_active {
                "Customer found successfully."
            } else {
                "Warning: Customer is not active."
            }
        })
    }

    fn find_card_product(&self, args: &Value) -> Value {
        let card_type: Option<CardType> = arg_enum(args, "cardType");
        let name = arg_str(args, "cardProductName");
        let network: Option<CardNetwork> = arg_enum(args, "cardNetwork");

        if card_type.is_none() && name.is_none() && network.is_none() {
            return json!({
                "product_info": {},
                "message": "No search criteria provided. Please provide at least one information \
                            (card type, product name, or card network) to search for a card product."
            });
        }

        let cards = self.store.cards.lock().unwrap();
        let matches: Vec<&CardProduct> = cards
            .iter()
            .filter(|card| {
                card_type.map_or(true, |wanted| card.card_type == wanted)
                    && contains_ci(&card.card_product_name, &name)
                    && network.map_or(true, |wanted| card.card_network == wanted)
            })
            .collect();

        if matches.is_empty() {
            return json!({
                "product_info": {},
                "message": "No card product found matching the provided criteria. Please ask back \
                            for different information."
            });
        }

        if matches.len() > 1 {
            let field = most_discriminating(&matches, &[
                ("cardType", &|c: &&CardProduct| format!("{:?}", c.card_type)),
                ("cardProductName", &|c: &&CardProduct| c.card_product_name.clone()),
                ("cardDescription", &|c: &&CardProduct| c.card_description.clone()),
                ("targetDescription", &|c: &&CardProduct| c.target_description.clone()),
                ("cardNetwork", &|c: &&CardProduct| format!("{:?}", c.card_network)),
            ]);
            return json!({
                "product_info": {},
                "message": format!(
                    "Multiple card products ({}) found matching the criteria. Please ask back for {}.",
                    matches.len(),
                    field
                )
            });
        }

        json!({
            "product_info": matches[0],
            "message": "Card product found successfully."
        })
    }

    fn find_rm_task(&self, args: &Value) -> Value {
        let customer_id = match optional_int(args, "customerId") {
            Ok(value) => value,
            Err(_) => {
                return json!({
                    "task_info": {},
                    "message": "Invalid customer ID. Customer ID must be an integer. Please provide \
                                a valid customer ID or ask back for customer information and use the \
                                `find_customer` tool to obtain it.",
                    "code": "failed"
                });
            }
        };
        let task_type: Option<TaskType> = arg_enum(args, "taskType");
        let task_status: Option<TaskStatus> = arg_enum(args, "taskStatus");

        let start = arg_str(args, "taskDueDateStart");
        let end = arg_str(args, "taskDueDateEnd");
        let start_date = match start {
            Some(ref text) => match parse_date(text) {
                Some(date) => Some(date),
                None => {
                    return json!({
                        "task_info": {},
                        "message": "Invalid start date. Please provide a valid start date in \
                                    YYYY-MM-DD format.",
                        "code": "failed"
                    });
                }
            },
            None => None,
        };
        let end_date = match end {
            Some(ref text) => match parse_date(text) {
                Some(date) => Some(date),
                None => {
                    return json!({
                        "task_info": {},
                        "message": "Invalid end date. Please provide a valid end date in \
                                    YYYY-MM-DD format.",
                        "code": "failed"
                    });
                }
            },
            None => None,
        };
        if let (Some(start), Some(end)) = (start_date, end_date) {
            if start > end {
                return json!({
                    "task_info": {},
                    "message": "Start date cannot be greater than end date. Please provide a valid \
                                date range.",
                    "code": "failed"
                });
            }
        }

        let tasks = self.store.tasks.lock().unwrap();
        let matches: Vec<&RmTask> = tasks
            .iter()
            .filter(|task| task.rm_id == self.rm_id)
            .filter(|task| {
                customer_id.map_or(true, |wanted| task.customer_id == wanted)
                    && task_type.map_or(true, |wanted| task.task_type == wanted)
                    && task_status.map_or(true, |wanted| task.status == wanted)
                    && start_date.map_or(true, |date| task.due_date >= date)
                    && end_date.map_or(true, |date| task.due_date <= date)
            })
            .collect();

        if matches.is_empty() {
            return json!({
                "task_info": {},
                "message": "No task found matching the provided criteria. Please ask back for \
                            different information.",
                "code": "failed"
            });
        }

        if matches.len() > 1 {
            let field = most_discriminating(&matches, &[
                ("customerId", &|t: &&RmTask| t.customer_id.to_string()),
                ("taskType", &|t: &&RmTask| format!("{:?}", t.task_type)),
                ("status", &|t: &&RmTask| format!("{:?}", t.status)),
                ("taskDetails", &|t: &&RmTask| t.task_details.clone()),
                ("dueDate", &|t: &&RmTask| t.due_date.to_string()),
            ]);
            let field_name = if field == "customerId" {
                "customer information"
            } else {
                field
            };
            return json!({
                "task_info": {},
                "message": format!(
                    "({}) tasks found matching the criteria. Please ask back for {} to identify \
                     a single task.",
                    matches.len(),
                    field_name
                ),
                "code": "failed"
            });
        }

        let task = matches[0];
        json!({
            "task_info": {
                "id": task.id,
                "customerId": task.customer_id,
                "taskType": task.task_type,
                "taskStatus": task.status,
                "taskDetails": task.task_details,
                "dueDate": task.due_date,
            },
            "message": "Task found successfully.",
            "code": "succeeded"
        })
    }

    /// Validation only; the write happens in the privileged counterpart
    fn create_rm_task(&self, args: &Value) -> Value {
        if args.get("customerId").and_then(Value::as_i64).is_none() {
            return json!({
                "message": "Invalid customer ID. Customer ID must be an integer. Please provide a \
                            valid customer ID or ask back for customer information and use the \
                            `find_customer` tool to obtain it.",
                "code": "failed"
            });
        }
        if arg_enum::<TaskType>(args, "taskType").is_none() {
            return json!({
                "message": "Invalid task type. Valid types are CALL, EMAIL, MEETING, FOLLOW_UP and \
                            SEND_INFO_PACKAGE.",
                "code": "failed"
            });
        }
        if arg_enum::<TaskStatus>(args, "taskStatus").is_none() {
            return json!({
                "message": "Invalid task status. Valid statuses are COMPLETED and IN_PROGRESS.",
                "code": "failed"
            });
        }
        let due_date = arg_str(args, "taskDueDate");
        if due_date.as_deref().and_then(parse_date).is_none() {
            return json!({
                "message": "Invalid task due date. Please provide a task due date in YYYY-MM-DD format.",
                "code": "failed"
            });
        }

        json!({
            "message": "All input is now valid.",
            "ask_confirmation": true,
            "code": "succeeded"
        })
    }

    /// Validation only; the write happens in the privileged counterpart
    fn update_rm_task(&self, args: &Value) -> Value {
        if args.get("rmTaskId").and_then(Value::as_i64).is_none() {
            return json!({
                "message": "Invalid task ID. Task ID must be an integer. Please provide a valid \
                            task ID or ask back for task information and use the `find_rm_task` \
                            tool to obtain it.",
                "code": "failed"
            });
        }

        let has_status = present(args, "updateTaskStatus");
        let has_due_date = present(args, "updateTaskDueDate");
        let has_details = present(args, "updateTaskDetails");
        if !has_status && !has_due_date && !has_details {
            return json!({
                "message": "No fields to update. Please provide a field to update.",
                "code": "failed"
            });
        }

        if has_status && arg_enum::<TaskStatus>(args, "updateTaskStatus").is_none() {
            return json!({
                "message": "Invalid task status. Valid statuses are COMPLETED and IN_PROGRESS.",
                "code": "failed"
            });
        }
        if has_due_date && arg_str(args, "updateTaskDueDate").as_deref().and_then(parse_date).is_none() {
            return json!({
                "message": "Invalid task due date. Please provide a task due date in YYYY-MM-DD format.",
                "code": "failed"
            });
        }

        json!({
            "message": "All input is now valid.",
            "ask_confirmation": true,
            "code": "succeeded"
        })
    }

    fn report_performance(&self, args: &Value) -> Value {
        let start = arg_str(args, "startDate");
        let end = arg_str(args, "endDate");
        let start_date = match start {
            Some(ref text) => match parse_date(text) {
                Some(date) => Some(date),
                None => {
                    return json!({
                        "task_info": {},
                        "message": "Invalid start date. Please provide a valid start date in \
                                    YYYY-MM-DD format.",
                        "code": "failed"
                    });
                }
            },
            None => None,
        };
        let end_date = match end {
            Some(ref text) => match parse_date(text) {
                Some(date) => Some(date),
                None => {
                    return json!({
                        "task_info": {},
                        "message": "Invalid end date. Please provide a valid end date in \
                                    YYYY-MM-DD format.",
                        "code": "failed"
                    });
                }
            },
            None => None,
        };

        let tasks = self.store.tasks.lock().unwrap();
        let in_range: Vec<&RmTask> = tasks
            .iter()
            .filter(|task| task.rm_id == self.rm_id)
            .filter(|task| {
                start_date.map_or(true, |date| task.created_at >= date)
                    && end_date.map_or(true, |date| task.created_at <= date)
            })
            .collect();

        if in_range.is_empty() {
            return json!({
                "task_info": {},
                "message": "No task found during the period. Please ask back for a different period.",
                "code": "failed"
            });
        }

        let mut report = Map::new();
        for status in [TaskStatus::Completed, TaskStatus::InProgress] {
            let count = in_range.iter().filter(|task| task.status == status).count();
            if count > 0 {
                report.insert(status.report_key().to_string(), json!(count));
            }
        }
        report.insert("total tasks".to_string(), json!(in_range.len()));

        json!({
            "performance_report": report,
            "message": "Performance report retrieved successfully.",
            "code": "succeeded"
        })
    }

    fn apply_create_rm_task(&self, args: &Value) -> Value {
        let Some(rm_id) = args.get("rmId").and_then(Value::as_i64) else {
            return json!({
                "message": "Relationship manager id not found in the session context.",
                "code": "failed"
            });
        };
        if !self.store.rms.lock().unwrap().iter().any(|rm| rm.id == rm_id) {
            return json!({
                "message": format!("Relationship Manager with ID {} not found", rm_id),
                "code": "failed"
            });
        }
        let Some(customer_id) = args.get("customerId").and_then(Value::as_i64) else {
            return json!({ "message": "Invalid customer ID", "code": "failed" });
        };
        if !self
            .store
            .customers
            .lock()
            .unwrap()
            .iter()
            .any(|customer| customer.id == customer_id)
        {
            return json!({
                "message": format!("Customer with ID {} not found", customer_id),
                "code": "failed"
            });
        }
        let Some(task_type) = arg_enum::<TaskType>(args, "taskType") else {
            return json!({ "message": "Invalid task type", "code": "failed" });
        };
        let Some(status) = arg_enum::<TaskStatus>(args, "taskStatus") else {
            return json!({ "message": "Invalid task status", "code": "failed" });
        };
        let Some(due_date) = arg_str(args, "taskDueDate").as_deref().and_then(parse_date)
        else {
            return json!({ "message": "Invalid task due date format", "code": "failed" });
        };
        let details = arg_str(args, "taskDetails").unwrap_or_default();

        let task_id = format!(
            "TASK-{}",
            Uuid::new_v4().simple().to_string()[..12].to_uppercase()
        );
        let mut tasks = self.store.tasks.lock().unwrap();
        let id = tasks.iter().map(|task| task.id).max().unwrap_or(0) + 1;
        tasks.push(RmTask {
            id,
            task_id: task_id.clone(),
            rm_id,
            customer_id,
            task_type,
            status,
            task_details: details,
            due_date,
            created_at: Local::now().date_naive(),
        });

        json!({
            "message": format!("Successfully created task in database. Task ID: {}", task_id),
            "code": "succeeded",
            "taskId": task_id,
            "id": id
        })
    }

    fn apply_update_rm_task(&self, args: &Value) -> Value {
        let Some(rm_task_id) = args.get("rmTaskId").and_then(Value::as_i64) else {
            return json!({ "message": "Invalid task ID", "code": "failed" });
        };

        let new_status = if present(args, "updateTaskStatus") {
            match arg_enum::<TaskStatus>(args, "updateTaskStatus") {
                Some(status) => Some(status),
                None => return json!({ "message": "Invalid task status", "code": "failed" }),
            }
        } else {
            None
        };
        let new_due_date = if present(args, "updateTaskDueDate") {
            match arg_str(args, "updateTaskDueDate").as_deref().and_then(parse_date) {
                Some(date) => Some(date),
                None => {
                    return json!({ "message": "Invalid task due date format", "code": "failed" })
                }
            }
        } else {
            None
        };
        let new_details = if present(args, "updateTaskDetails") {
            arg_str(args, "updateTaskDetails")
        } else {
            None
        };

        let mut tasks = self.store.tasks.lock().unwrap();
        let Some(task) = tasks.iter_mut().find(|task| task.id == rm_task_id) else {
            return json!({
                "message": format!("No task found with ID {}", rm_task_id),
                "code": "failed"
            });
        };

        if let Some(status) = new_status {
            task.status = status;
        }
        if let Some(due_date) = new_due_date {
            task.due_date = due_date;
        }
        if let Some(details) = new_details {
            task.task_details = details;
        }

        json!({
            "message": format!("Successfully updated task. Task ID: {}", task.task_id),
            "code": "succeeded",
            "taskId": task.task_id,
            "id": task.id
        })
    }
}

#[async_trait]
impl Toolkit for CrmToolkit {
    fn name(&self) -> &str {
        "crm"
    }

    fn instructions(&self) -> &str {
        indoc! {"
            Search the RM's own customer book with `find_customer`, the card
            catalog with `find_card_product` and scheduled work with
            `find_rm_task`. When a search reports multiple matches, relay its
            question back to the user instead of guessing. `create_rm_task`
            and `update_rm_task` only validate the input; the change is
            applied after the user confirms. `report_performance` summarises
            task counts over a date range.
        "}
    }

    fn tools(&self) -> &[Tool] {
        &self.tools
    }

    fn privileged_tools(&self) -> &[Tool] {
        &self.privileged
    }

    fn privileged_bindings(&self) -> Vec<(String, String)> {
        vec![
            (CREATE_TASK_TOOL.to_string(), APPLY_CREATE_TASK_TOOL.to_string()),
            (UPDATE_TASK_TOOL.to_string(), APPLY_UPDATE_TASK_TOOL.to_string()),
        ]
    }

    async fn call(&self, tool_call: ToolCall) -> AgentResult<Value> {
        let args = &tool_call.arguments;
        match tool_call.name.as_str() {
            "find_customer" => Ok(self.find_customer(args)),
            "find_card_product" => Ok(self.find_card_product(args)),
            "find_rm_task" => Ok(self.find_rm_task(args)),
            CREATE_TASK_TOOL => Ok(self.create_rm_task(args)),
            UPDATE_TASK_TOOL => Ok(self.update_rm_task(args)),
            "report_performance" => Ok(self.report_performance(args)),
            APPLY_CREATE_TASK_TOOL => Ok(self.apply_create_rm_task(args)),
            APPLY_UPDATE_TASK_TOOL => Ok(self.apply_update_rm_task(args)),
            _ => Err(AgentError::ToolNotFound(tool_call.name)),
        }
    }
}

fn arg_str(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(|text| text.to_string())
}

fn arg_enum<T: serde::de::DeserializeOwned>(args: &Value, key: &str) -> Option<T> {
    args.get(key)
        .filter(|value| !value.is_null())
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

/// Present means the key exists and is not an explicit null ("leave unchanged")
fn present(args: &Value, key: &str) -> bool {
    args.get(key).map_or(false, |value| !value.is_null())
}

/// An integer criterion: absent is fine, non-integer is an input error
fn optional_int(args: &Value, key: &str) -> Result<Option<i64>, ()> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_i64().map(Some).ok_or(()),
    }
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, DATE_FORMAT).ok()
}

fn contains_ci(haystack: &str, needle: &Option<String>) -> bool {
    match needle {
        Some(needle) => haystack.to_lowercase().contains(&needle.to_lowercase()),
        None => true,
    }
}

/// The field with the most distinct values across the matches, used to ask
/// the user for the detail most likely to single one out
fn most_discriminating<'a, T>(
    matches: &[T],
    fields: &[(&'a str, &dyn Fn(&T) -> String)],
) -> &'a str {
    let mut best = (fields[0].0, 0usize);
    for &(name, extract) in fields {
        let distinct: std::collections::HashSet<String> =
            matches.iter().map(|item| extract(item)).collect();
        if distinct.len() > best.1 {
            best = (name, distinct.len());
        }
    }
    best.0
}
